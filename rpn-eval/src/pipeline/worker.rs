use super::RawResult;
use crate::{
    common::*,
    loader::Batch,
    model::{Device, Model},
};

/// A long-lived inference worker bound to one device.
pub struct Worker {
    pub device: Device,
    pub model: Box<dyn Model>,
    pub data_rx: Receiver<Batch>,
    pub result_tx: Sender<Result<RawResult>>,
}

impl Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("device", &self.device)
            .finish()
    }
}

impl Worker {
    /// Pop batches until the data queue is closed.
    ///
    /// A failed or panicked forward pass is pushed to the result queue as an
    /// [Error::Inference] and ends the worker.
    pub async fn run(self) {
        let Self {
            device,
            mut model,
            data_rx,
            result_tx,
        } = self;
        let mut num_batches = 0usize;

        while let Ok(batch) = data_rx.recv().await {
            let split = batch.split;
            let rec_ids = batch.rec_id.decode("rec_id").unwrap_or_default();
            let inference_error = |source: BoxError| Error::Inference {
                device,
                split,
                rec_ids: rec_ids.clone(),
                source,
            };

            let joined = tokio::task::spawn_blocking(move || {
                let output = model.forward(&batch);
                (model, batch, output)
            })
            .await;

            let (model_, batch, output) = match joined {
                Ok(tuple) => tuple,
                Err(err) => {
                    // the model is lost along with the panicked thread
                    let _ = result_tx.send(Err(inference_error(err.into()))).await;
                    break;
                }
            };
            model = model_;

            let result = output
                .map_err(|err| inference_error(err.into()))
                .and_then(|output| {
                    RawResult::new(batch, output).map_err(|msg| inference_error(msg.into()))
                });
            let failed = result.is_err();

            if result_tx.send(result).await.is_err() || failed {
                break;
            }
            num_batches += 1;
        }

        info!("worker on {} stopped after {} batches", device, num_batches);
    }
}
