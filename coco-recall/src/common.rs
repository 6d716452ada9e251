pub use anyhow::{ensure, format_err, Context as _, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use serde::{Deserialize, Serialize};
pub use std::{collections::HashMap, fmt, fs, path::Path};
pub use tracing::info;
