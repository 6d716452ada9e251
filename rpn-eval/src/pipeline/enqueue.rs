use crate::{common::*, loader::Batch};

/// Push every batch of a split into the data queue, waiting while it is full.
///
/// Returns the number of batches sent. If the queue is closed because all
/// workers are gone, it stops early and leaves the error report to the
/// collector.
pub async fn enqueue<S>(split: usize, mut batches: S, data_tx: Sender<Batch>) -> Result<usize>
where
    S: Stream<Item = Result<Batch>> + Unpin,
{
    let mut num_batches = 0;

    while let Some(batch) = batches.next().await {
        let batch = batch?;
        debug_assert_eq!(batch.split, split);

        if data_tx.send(batch).await.is_err() {
            warn!("data queue closed in split {}", split);
            break;
        }
        num_batches += 1;
    }

    Ok(num_batches)
}
