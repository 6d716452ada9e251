pub use crate::error::{Error, Result};
pub use anyhow::{ensure, format_err, Context as _};
pub use async_channel::{Receiver, Sender};
pub use futures::{
    future::FutureExt as _,
    stream::{self, Stream, StreamExt as _, TryStreamExt as _},
};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayView2, Axis};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use par_stream::{prelude::*, ParParamsConfig};
pub use rand::{prelude::*, rngs::StdRng};
pub use semver::{Version, VersionReq};
pub use serde::{
    de::Error as DeserializeError, Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Display},
    fs,
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    pin::Pin,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
pub use tracing::{info, info_span, warn, Instrument as _};

/// Result type of external collaborators.
pub type Fallible<T> = anyhow::Result<T>;

/// Boxed error carried as the source of pipeline errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
