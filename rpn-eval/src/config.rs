use crate::{
    common::*,
    identity::IdentityTransport,
    loader::LoaderOptions,
    model::Device,
    pipeline::PipelineOptions,
    transform::ScaleSpec,
};

pub use dataset::*;
pub use loader::*;
pub use model::*;
pub use pipeline::*;
pub use postprocess::*;
pub use run::*;
pub use scorer::*;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1.0").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    pub run: RunConfig,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub loader: LoaderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub postprocess: PostprocessConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.dataset.image_sets.is_empty() {
            return invalid("dataset.image_sets must not be empty");
        }
        if self.model.devices.is_empty() {
            return invalid("model.devices must not be empty");
        }
        let unique_devices: HashSet<_> = self.model.devices.iter().collect();
        if unique_devices.len() != self.model.devices.len() {
            return invalid("model.devices must not contain duplicates");
        }
        if self.scorer.max_dets.is_empty() {
            return invalid("scorer.max_dets must not be empty");
        }
        if matches!(self.pipeline.collect_timeout_secs, Some(secs) if secs <= 0.0) {
            return invalid("pipeline.collect_timeout_secs must be positive");
        }
        self.pipeline.options()?;

        self.loader
            .transform
            .scale()
            .check()
            .map_err(|err| Error::Config(format!("loader.transform: {}", err)))?;
        for scale in &self.loader.test_scales {
            scale
                .check()
                .map_err(|err| Error::Config(format!("loader.test_scales: {}", err)))?;
        }
        for filter in &self.postprocess.filters {
            if let FilterConfig::MinSize { min_size } = filter {
                if *min_size < 0.0 {
                    return invalid("min_size filter must be non-negative");
                }
            }
        }

        Ok(())
    }
}

mod run {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RunConfig {
        /// The name of the run, used as the result directory name.
        pub name: String,
        #[serde(default = "default_experiments_dir")]
        pub experiments_dir: PathBuf,
    }

    fn default_experiments_dir() -> PathBuf {
        "experiments".into()
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory of record caches.
        #[serde(default = "default_cache_root")]
        pub cache_root: PathBuf,
        /// The file extension of record caches.
        #[serde(default = "default_cache_ext")]
        pub cache_ext: String,
        /// Image sets to evaluate. The first one names the result file.
        pub image_sets: Vec<String>,
        /// COCO instances file for scoring.
        pub annotation_file: PathBuf,
    }

    fn default_cache_root() -> PathBuf {
        "data/cache".into()
    }

    fn default_cache_ext() -> String {
        "roidb.json".into()
    }
}

mod model {
    use super::*;

    /// Model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        pub kind: ModelKind,
        /// Checkpoint prefix.
        pub prefix: PathBuf,
        /// Checkpoint epoch.
        pub epoch: usize,
        /// One worker is started per device.
        pub devices: Vec<Device>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ModelKind {
        /// Replay dumped proposals.
        Precomputed,
    }
}

mod loader {
    use super::*;

    /// Data loading options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoaderConfig {
        pub batch_size: NonZeroUsize,
        #[serde(default)]
        pub shuffle: bool,
        #[serde(default)]
        pub seed: u64,
        pub num_workers: Option<NonZeroUsize>,
        #[serde(default)]
        pub identity_transport: IdentityTransport,
        pub transform: TransformConfig,
        /// Evaluate every record once per scale when not empty.
        #[serde(default)]
        pub test_scales: Vec<ScaleSpec>,
    }

    impl LoaderConfig {
        pub fn options(&self) -> LoaderOptions {
            LoaderOptions {
                batch_size: self.batch_size,
                shuffle: self.shuffle,
                seed: self.seed,
                num_workers: self.num_workers,
                identity_transport: self.identity_transport,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum TransformConfig {
        /// Compute image info only.
        MetaOnly { short: usize, long: usize },
        /// Decode, resize and normalize images.
        Resize {
            short: usize,
            long: usize,
            #[serde(default = "default_mean")]
            mean: [R64; 3],
            #[serde(default = "default_std")]
            std: [R64; 3],
        },
    }

    impl TransformConfig {
        pub fn scale(&self) -> ScaleSpec {
            let (short, long) = match *self {
                Self::MetaOnly { short, long } => (short, long),
                Self::Resize { short, long, .. } => (short, long),
            };
            ScaleSpec { short, long }
        }
    }

    fn default_mean() -> [R64; 3] {
        [r64(123.68), r64(116.779), r64(103.939)]
    }

    fn default_std() -> [R64; 3] {
        [r64(1.0), r64(1.0), r64(1.0)]
    }
}

mod pipeline {
    use super::*;

    /// Queue options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PipelineConfig {
        /// The number of records evaluated at a time.
        #[serde(default = "default_split_size")]
        pub split_size: NonZeroUsize,
        #[serde(default = "default_data_queue_size")]
        pub data_queue_size: NonZeroUsize,
        /// Fail if no result arrives within this many seconds.
        pub collect_timeout_secs: Option<R64>,
    }

    impl Default for PipelineConfig {
        fn default() -> Self {
            Self {
                split_size: default_split_size(),
                data_queue_size: default_data_queue_size(),
                collect_timeout_secs: None,
            }
        }
    }

    impl PipelineConfig {
        pub fn options(&self) -> Result<PipelineOptions> {
            let collect_timeout = self
                .collect_timeout_secs
                .map(|secs| {
                    Duration::try_from_secs_f64(secs.raw()).map_err(|_| {
                        Error::Config(format!(
                            "pipeline.collect_timeout_secs {} is not a valid duration",
                            secs
                        ))
                    })
                })
                .transpose()?;

            Ok(PipelineOptions {
                data_queue_size: self.data_queue_size,
                collect_timeout,
            })
        }
    }

    fn default_split_size() -> NonZeroUsize {
        NonZeroUsize::new(1000).unwrap()
    }

    fn default_data_queue_size() -> NonZeroUsize {
        NonZeroUsize::new(100).unwrap()
    }
}

mod postprocess {
    use super::*;

    /// Result conversion options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PostprocessConfig {
        /// Detections kept per image.
        #[serde(default = "default_max_dets")]
        pub max_dets: NonZeroUsize,
        #[serde(default = "default_category_id")]
        pub category_id: u64,
        /// Output filters in application order.
        #[serde(default)]
        pub filters: Vec<FilterConfig>,
    }

    impl Default for PostprocessConfig {
        fn default() -> Self {
            Self {
                max_dets: default_max_dets(),
                category_id: default_category_id(),
                filters: vec![],
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum FilterConfig {
        ClipToImage,
        MinSize { min_size: R64 },
    }

    fn default_max_dets() -> NonZeroUsize {
        NonZeroUsize::new(100).unwrap()
    }

    fn default_category_id() -> u64 {
        1
    }
}

mod scorer {
    use super::*;

    /// Scoring options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ScorerConfig {
        #[serde(default = "default_max_dets")]
        pub max_dets: Vec<usize>,
    }

    impl Default for ScorerConfig {
        fn default() -> Self {
            Self {
                max_dets: default_max_dets(),
            }
        }
    }

    fn default_max_dets() -> Vec<usize> {
        vec![1, 10, 100]
    }
}

pub fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let version = Version::parse(&text).map_err(|err| {
        D::Error::custom(format!(
            "failed to parse version number '{}': {:?}",
            text, err
        ))
    })?;

    if !CONFIG_VERSION.matches(&version) {
        return Err(D::Error::custom(format!(
            "incompatible version: get '{}', but it is incompatible with requirement '{}'",
            version, &*CONFIG_VERSION,
        )));
    }

    Ok(version)
}
