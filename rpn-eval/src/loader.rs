use crate::{
    common::*,
    identity::{IdentityArray, IdentityTransport},
    model::DataDesc,
    record::Record,
    transform::{Transform, Transformed},
};

/// A group of transformed records.
///
/// Row `i` of every field belongs to the same record.
#[derive(Debug, Clone)]
pub struct Batch {
    pub split: usize,
    /// Image tensors in `[b, c, h, w]` layout, zero padded to the largest
    /// image of the batch.
    pub data: Array4<f32>,
    pub rec_id: IdentityArray,
    pub im_id: IdentityArray,
    /// `(height, width, scale)` per record.
    pub im_info: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.im_info.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batch loading options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderOptions {
    pub batch_size: NonZeroUsize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
    /// The number of records transformed in parallel.
    pub num_workers: Option<NonZeroUsize>,
    #[serde(default)]
    pub identity_transport: IdentityTransport,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(1).unwrap(),
            shuffle: false,
            seed: 0,
            num_workers: None,
            identity_transport: IdentityTransport::Int64,
        }
    }
}

/// Turns the records of one split into a restartable stream of batches.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    split: usize,
    records: Arc<Vec<Record>>,
    transform: Arc<dyn Transform>,
    options: LoaderOptions,
}

impl BatchLoader {
    pub fn new(
        split: usize,
        records: Vec<Record>,
        transform: Arc<dyn Transform>,
        options: LoaderOptions,
    ) -> Self {
        Self {
            split,
            records: Arc::new(records),
            transform,
            options,
        }
    }

    pub fn split(&self) -> usize {
        self.split
    }

    pub fn total_record(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Declared input fields and their shapes.
    pub fn provide_data(&self) -> Vec<DataDesc> {
        let batch_size = self.options.batch_size.get();
        let [c, h, w] = self.transform.data_shape();

        vec![
            DataDesc {
                name: "data".into(),
                shape: vec![batch_size, c, h, w],
            },
            DataDesc {
                name: "im_info".into(),
                shape: vec![batch_size, 3],
            },
            DataDesc {
                name: "im_id".into(),
                shape: vec![batch_size],
            },
            DataDesc {
                name: "rec_id".into(),
                shape: vec![batch_size],
            },
        ]
    }

    /// Start a new pass over the records.
    ///
    /// Batches are prepared in parallel and may come out in any order.
    pub fn stream(&self) -> Pin<Box<dyn Stream<Item = Result<Batch>> + Send>> {
        let split = self.split;
        let LoaderOptions {
            batch_size,
            shuffle,
            seed,
            num_workers,
            identity_transport,
        } = self.options;
        // defaults to the number of CPUs when unset
        let par_params = num_workers.map(|num| ParParamsConfig::FixedWorkers {
            num_workers: num.get(),
        });

        let order: Vec<usize> = {
            let mut order: Vec<_> = (0..self.records.len()).collect();
            if shuffle {
                let mut rng = StdRng::seed_from_u64(seed);
                order.shuffle(&mut rng);
            }
            order
        };
        let chunks: Vec<Vec<usize>> = order
            .chunks(batch_size.get())
            .map(|chunk| chunk.to_vec())
            .collect();

        let records = self.records.clone();
        let transform = self.transform.clone();

        let stream = stream::iter(chunks).par_map_unordered(par_params, move |indexes| {
            let records = records.clone();
            let transform = transform.clone();

            move || {
                let records: Vec<&Record> = indexes.iter().map(|&index| &records[index]).collect();
                build_batch(split, &records, &*transform, identity_transport)
            }
        });

        Box::pin(stream)
    }
}

fn build_batch(
    split: usize,
    records: &[&Record],
    transform: &dyn Transform,
    transport: IdentityTransport,
) -> Result<Batch> {
    let transformed: Vec<Transformed> = records
        .iter()
        .map(|record| {
            transform.apply(record).map_err(|err| Error::Loader {
                split,
                rec_id: record.rec_id,
                im_id: record.im_id,
                source: err.into(),
            })
        })
        .try_collect()?;

    // pad images to the largest size in the batch
    let (channels, max_h, max_w) = transformed.iter().fold((None, 0, 0), |(c, h, w), item| {
        let (ic, ih, iw) = item.data.dim();
        (c.or(Some(ic)), h.max(ih), w.max(iw))
    });
    let channels = channels.unwrap_or(0);

    let mut data = Array4::zeros((records.len(), channels, max_h, max_w));
    let mut im_info = Array2::zeros((records.len(), 3));

    for (index, (record, item)) in records.iter().zip(&transformed).enumerate() {
        let (c, h, w) = item.data.dim();
        if c != channels {
            return Err(Error::Loader {
                split,
                rec_id: record.rec_id,
                im_id: record.im_id,
                source: format!("expect {} channels, but get {}", channels, c).into(),
            });
        }
        data.slice_mut(s![index, .., ..h, ..w]).assign(&item.data);
        im_info.row_mut(index).assign(&ndarray::arr1(&item.im_info));
    }

    let rec_ids: Vec<u64> = records.iter().map(|record| record.rec_id as u64).collect();
    let im_ids: Vec<u64> = records.iter().map(|record| record.im_id).collect();

    Ok(Batch {
        split,
        data,
        rec_id: transport.encode("rec_id", &rec_ids)?,
        im_id: transport.encode("im_id", &im_ids)?,
        im_info,
    })
}
