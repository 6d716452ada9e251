//! Model collaborator interface and the bundled proposal replay backend.

use crate::{common::*, loader::Batch};

/// The compute device a worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let device = match text {
            "cpu" => Self::Cpu,
            "cuda" => Self::Cuda(0),
            _ => {
                let index = text
                    .strip_prefix("cuda:")
                    .ok_or_else(|| format_err!("invalid device '{}'", text))?;
                let index: usize = index
                    .parse()
                    .with_context(|| format!("invalid device index in '{}'", text))?;
                Self::Cuda(index)
            }
        };
        Ok(device)
    }
}

impl Serialize for Device {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse()
            .map_err(|err| D::Error::custom(format!("{:#}", err)))
    }
}

/// A declared input field of the model, `(name, shape)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDesc {
    pub name: String,
    pub shape: Vec<usize>,
}

/// The numeric outputs of one forward pass, one entry per batch record.
///
/// Boxes are `[n, 4]` (or `[n, 4 * classes]`) in network input space, scores
/// are `[n, 1]` (or `[n, classes]`).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub boxes: Vec<Array2<f32>>,
    pub scores: Vec<Array2<f32>>,
}

/// A model bound to one device.
pub trait Model
where
    Self: Send + 'static,
{
    fn forward(&mut self, batch: &Batch) -> Fallible<ModelOutput>;
}

/// Loads one model instance per device.
pub trait ModelLoader
where
    Self: Send + Sync,
{
    fn load(&self, device: Device, provide_data: &[DataDesc]) -> Fallible<Box<dyn Model>>;
}

#[derive(Debug, Clone, Deserialize)]
struct Proposal {
    /// Boxes in original image coordinates, `[x0, y0, x1, y1]`.
    boxes: Vec<[f32; 4]>,
    scores: Vec<f32>,
}

/// Replays proposals dumped from a checkpoint.
///
/// The dump lives at `<prefix>-<epoch:04>.proposals.json` and maps `im_id`
/// to the proposals of that image.
#[derive(Debug, Clone)]
pub struct PrecomputedLoader {
    proposals: Arc<HashMap<u64, Proposal>>,
}

impl PrecomputedLoader {
    pub fn checkpoint_path(prefix: &Path, epoch: usize) -> PathBuf {
        PathBuf::from(format!("{}-{:04}.proposals.json", prefix.display(), epoch))
    }

    pub fn open(prefix: &Path, epoch: usize) -> Fallible<Self> {
        let path = Self::checkpoint_path(prefix, epoch);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read proposal dump '{}'", path.display()))?;
        let proposals: HashMap<u64, Proposal> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse proposal dump '{}'", path.display()))?;

        for (im_id, proposal) in &proposals {
            ensure!(
                proposal.boxes.len() == proposal.scores.len(),
                "im_id {} has {} boxes but {} scores",
                im_id,
                proposal.boxes.len(),
                proposal.scores.len()
            );
        }

        info!(
            "loaded proposals of {} images from '{}'",
            proposals.len(),
            path.display()
        );

        Ok(Self {
            proposals: Arc::new(proposals),
        })
    }
}

impl ModelLoader for PrecomputedLoader {
    fn load(&self, device: Device, provide_data: &[DataDesc]) -> Fallible<Box<dyn Model>> {
        ensure!(
            provide_data.iter().any(|desc| desc.name == "im_id"),
            "the loader does not provide the im_id field"
        );
        info!("bind proposal replay on device {}", device);

        Ok(Box::new(PrecomputedModel {
            proposals: self.proposals.clone(),
        }))
    }
}

#[derive(Debug)]
struct PrecomputedModel {
    proposals: Arc<HashMap<u64, Proposal>>,
}

impl Model for PrecomputedModel {
    fn forward(&mut self, batch: &Batch) -> Fallible<ModelOutput> {
        let im_ids = batch.im_id.decode("im_id")?;

        let (boxes, scores) = im_ids
            .iter()
            .enumerate()
            .map(|(index, im_id)| -> Fallible<_> {
                let scale = batch.im_info[[index, 2]];
                match self.proposals.get(im_id) {
                    Some(Proposal { boxes, scores }) => {
                        let num_boxes = boxes.len();
                        let flat: Vec<f32> = boxes.iter().flatten().map(|&v| v * scale).collect();
                        let boxes = Array2::from_shape_vec((num_boxes, 4), flat)?;
                        let scores = Array2::from_shape_vec((num_boxes, 1), scores.clone())?;
                        Ok((boxes, scores))
                    }
                    None => Ok((Array2::zeros((0, 4)), Array2::zeros((0, 1)))),
                }
            })
            .collect::<Fallible<Vec<_>>>()?
            .into_iter()
            .unzip();

        Ok(ModelOutput { boxes, scores })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
        assert!("gpu0".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn replay_proposals_in_network_space() -> Fallible<()> {
        use crate::identity::IdentityArray;
        use ndarray::array;

        let dir = std::env::temp_dir().join(format!("rpn-eval-model-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let prefix = dir.join("rpn");
        fs::write(
            PrecomputedLoader::checkpoint_path(&prefix, 2),
            r#"{ "5": { "boxes": [[2.0, 4.0, 6.0, 8.0]], "scores": [0.5] } }"#,
        )?;

        let loader = PrecomputedLoader::open(&prefix, 2)?;
        let provide_data = [DataDesc {
            name: "im_id".into(),
            shape: vec![2],
        }];
        let mut model = loader.load(Device::Cpu, &provide_data)?;

        let batch = Batch {
            split: 0,
            data: Array4::zeros((2, 3, 0, 0)),
            rec_id: IdentityArray::Int64(vec![0, 1]),
            im_id: IdentityArray::Int64(vec![5, 9]),
            im_info: array![[50.0, 100.0, 0.5], [50.0, 100.0, 0.5]],
        };
        let ModelOutput { boxes, scores } = model.forward(&batch)?;

        assert_eq!(boxes[0], array![[1.0f32, 2.0, 3.0, 4.0]]);
        assert_eq!(scores[0], array![[0.5f32]]);
        assert_eq!(boxes[1].dim(), (0, 4));
        assert_eq!(scores[1].dim(), (0, 1));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn checkpoint_path_convention() {
        let path = PrecomputedLoader::checkpoint_path(Path::new("model/rpn"), 6);
        assert_eq!(path, Path::new("model/rpn-0006.proposals.json"));
    }
}
