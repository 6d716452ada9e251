//! The batched inference pipeline.
//!
//! Batches flow from an enqueuer task through a bounded data queue into one
//! worker per device. Workers push raw results into an unbounded result queue
//! that the collector drains until every record of the split is accounted for.

mod collector;
mod enqueue;
mod worker;

pub use collector::*;
pub use enqueue::*;
pub use worker::*;

use crate::{
    common::*,
    identity::IdentityArray,
    loader::{Batch, BatchLoader},
    model::{Device, Model, ModelOutput},
};
use tokio::task::JoinHandle;

/// Outputs of one forward pass, still in network input space.
#[derive(Debug, Clone)]
pub struct RawResult {
    pub split: usize,
    pub rec_id: IdentityArray,
    pub im_id: IdentityArray,
    pub im_info: Array2<f32>,
    pub boxes: Vec<Array2<f32>>,
    pub scores: Vec<Array2<f32>>,
}

impl RawResult {
    /// Pair the model output with the identity of the batch it was computed
    /// from.
    pub fn new(batch: Batch, output: ModelOutput) -> Result<Self, String> {
        let Batch {
            split,
            rec_id,
            im_id,
            im_info,
            ..
        } = batch;
        let ModelOutput { boxes, scores } = output;
        let num_records = im_info.nrows();

        if boxes.len() != num_records || scores.len() != num_records {
            return Err(format!(
                "the model returned {} box arrays and {} score arrays for {} records",
                boxes.len(),
                scores.len(),
                num_records
            ));
        }

        Ok(Self {
            split,
            rec_id,
            im_id,
            im_info,
            boxes,
            scores,
        })
    }

    /// The number of records carried.
    pub fn len(&self) -> usize {
        self.im_info.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The detections of one record in original image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub rec_id: usize,
    pub im_id: u64,
    pub im_info: [f32; 3],
    /// `[n, 4]` (or `[n, 4 * classes]`) boxes in `[x0, y0, x1, y1]` form.
    pub bbox_xyxy: Array2<f32>,
    /// `[n, 1]` (or `[n, classes]`) scores, row aligned with `bbox_xyxy`.
    pub cls_score: Array2<f32>,
}

/// Pipeline options.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Capacity of the data queue.
    pub data_queue_size: NonZeroUsize,
    /// Give up if no result arrives within this duration.
    pub collect_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            data_queue_size: NonZeroUsize::new(100).unwrap(),
            collect_timeout: None,
        }
    }
}

/// Owns the queues and the worker pool of a run.
///
/// Workers are started once and serve every split. They stop after
/// [Pipeline::shutdown] closes the data queue.
#[derive(Debug)]
pub struct Pipeline {
    data_tx: Sender<Batch>,
    result_rx: Receiver<Result<RawResult>>,
    workers: Vec<JoinHandle<()>>,
    collect_timeout: Option<Duration>,
}

impl Pipeline {
    /// Start one worker per model. Must be called within a tokio runtime.
    pub fn new(models: Vec<(Device, Box<dyn Model>)>, options: PipelineOptions) -> Result<Self> {
        if models.is_empty() {
            return Err(Error::Config("at least one worker is required".into()));
        }

        let PipelineOptions {
            data_queue_size,
            collect_timeout,
        } = options;
        let (data_tx, data_rx) = async_channel::bounded(data_queue_size.get());
        let (result_tx, result_rx) = async_channel::unbounded();

        let workers: Vec<_> = models
            .into_iter()
            .map(|(device, model)| {
                let worker = Worker {
                    device,
                    model,
                    data_rx: data_rx.clone(),
                    result_tx: result_tx.clone(),
                };
                tokio::spawn(worker.run().instrument(info_span!("worker", %device)))
            })
            .collect();

        info!(
            "started {} workers, data queue capacity {}",
            workers.len(),
            data_queue_size
        );

        Ok(Self {
            data_tx,
            result_rx,
            workers,
            collect_timeout,
        })
    }

    /// Feed every batch of the loader through the workers and collect exactly
    /// one output per record.
    ///
    /// The outputs are ordered by `rec_id`.
    pub async fn run_split(&self, loader: &BatchLoader) -> Result<Vec<OutputRecord>> {
        let split = loader.split();
        let mut enqueue_task = tokio::spawn(
            enqueue(split, loader.stream(), self.data_tx.clone())
                .instrument(info_span!("enqueue", split)),
        );

        let collector = Collector {
            split,
            total_record: loader.total_record(),
            result_rx: &self.result_rx,
            timeout: self.collect_timeout,
        };

        let enqueue_fut = (&mut enqueue_task).map(|joined| match joined {
            Ok(result) => result,
            Err(source) => Err(Error::Join {
                task: "enqueue",
                split,
                source,
            }),
        });

        let result = futures::try_join!(enqueue_fut, collector.collect());

        match result {
            Ok((num_batches, outputs)) => {
                info!(
                    "split {} done, {} batches, {} records",
                    split,
                    num_batches,
                    outputs.len()
                );
                Ok(outputs)
            }
            Err(err) => {
                enqueue_task.abort();
                Err(err)
            }
        }
    }

    /// Close the data queue and wait for the workers to leave.
    pub async fn shutdown(self) {
        let Self {
            data_tx, workers, ..
        } = self;
        drop(data_tx);

        for joined in futures::future::join_all(workers).await {
            if let Err(err) = joined {
                warn!("worker did not stop cleanly: {}", err);
            }
        }
    }
}
