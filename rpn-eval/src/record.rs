//! Detection records, record caches and split iteration.

use crate::{common::*, transform::ScaleSpec};

/// One input unit, an image or a crop of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Position inside the current split. Reassigned for every split.
    #[serde(default)]
    pub rec_id: usize,
    /// The durable dataset identity of the source image.
    pub im_id: u64,
    pub image: PathBuf,
    pub height: usize,
    pub width: usize,
    /// Ground truth boxes in `[x0, y0, x1, y1]` form.
    #[serde(default)]
    pub gt_boxes: Vec<[f32; 4]>,
    #[serde(default)]
    pub flipped: bool,
    /// Overrides the transform's scale when set.
    #[serde(default)]
    pub scale: Option<ScaleSpec>,
}

/// Path of the record cache of an image set, `<cache_root>/<image_set>.<ext>`.
pub fn cache_path(cache_root: &Path, image_set: &str, ext: &str) -> PathBuf {
    cache_root.join(format!("{}.{}", image_set, ext))
}

/// Load the record caches of all image sets and concatenate them in order.
pub fn load_records(cache_root: &Path, image_sets: &[String], ext: &str) -> Fallible<Vec<Record>> {
    let mut records = vec![];

    for image_set in image_sets {
        let path = cache_path(cache_root, image_set, ext);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read record cache '{}'", path.display()))?;
        let set_records: Vec<Record> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse record cache '{}'", path.display()))?;
        info!(
            "loaded {} records of image set '{}'",
            set_records.len(),
            image_set
        );
        records.extend(set_records);
    }

    Ok(records)
}

/// Per-split record preparation applied before `rec_id` assignment.
pub trait RecordProcessor
where
    Self: Debug + Send + Sync,
{
    fn process(&self, records: Vec<Record>) -> Fallible<Vec<Record>>;
}

/// Duplicates every record once per test scale, so that the detections of
/// all scales fan in to the same image.
#[derive(Debug, Clone)]
pub struct MultiScale {
    scales: Vec<ScaleSpec>,
}

impl MultiScale {
    pub fn new(scales: Vec<ScaleSpec>) -> Fallible<Self> {
        ensure!(!scales.is_empty(), "at least one test scale is required");
        Ok(Self { scales })
    }
}

impl RecordProcessor for MultiScale {
    fn process(&self, records: Vec<Record>) -> Fallible<Vec<Record>> {
        let records = records
            .into_iter()
            .flat_map(|record| {
                self.scales.iter().map(move |&scale| Record {
                    scale: Some(scale),
                    ..record.clone()
                })
            })
            .collect();
        Ok(records)
    }
}

/// A chunk of the record collection, processed end-to-end before the next.
#[derive(Debug, Clone)]
pub struct Split {
    pub index: usize,
    /// Range of the split in the full record collection.
    pub range: Range<usize>,
    /// Prepared records with `rec_id` equal to their position.
    pub records: Vec<Record>,
}

/// Iterates the full record collection in fixed-size splits to bound peak
/// memory.
#[derive(Debug)]
pub struct RecordStream {
    records: Vec<Record>,
    split_size: usize,
}

impl RecordStream {
    pub fn new(records: Vec<Record>, split_size: NonZeroUsize) -> Self {
        Self {
            records,
            split_size: split_size.get(),
        }
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    pub fn num_splits(&self) -> usize {
        (self.records.len() + self.split_size - 1) / self.split_size
    }

    pub fn splits<'a>(
        &'a self,
        processors: &'a [Box<dyn RecordProcessor>],
    ) -> impl Iterator<Item = Result<Split>> + 'a {
        self.records
            .chunks(self.split_size)
            .enumerate()
            .map(move |(index, chunk)| -> Result<Split> {
                let start = index * self.split_size;
                let range = start..(start + chunk.len());

                let records = processors
                    .iter()
                    .try_fold(chunk.to_vec(), |records, processor| {
                        processor.process(records)
                    })
                    .map_err(|err| Error::Records {
                        split: index,
                        source: err.into(),
                    })?;

                let records = records
                    .into_iter()
                    .enumerate()
                    .map(|(rec_id, record)| Record { rec_id, ..record })
                    .collect();

                Ok(Split {
                    index,
                    range,
                    records,
                })
            })
    }
}
