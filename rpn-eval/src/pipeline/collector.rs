use super::{OutputRecord, RawResult};
use crate::common::*;

/// Drains the result queue for one split.
#[derive(Debug)]
pub struct Collector<'a> {
    pub split: usize,
    /// The number of records, not batches, to collect.
    pub total_record: usize,
    pub result_rx: &'a Receiver<Result<RawResult>>,
    pub timeout: Option<Duration>,
}

impl<'a> Collector<'a> {
    /// Pop results until every record of the split is collected.
    ///
    /// The outputs are sorted by `rec_id`, so their order does not depend on
    /// which worker finished first.
    pub async fn collect(self) -> Result<Vec<OutputRecord>> {
        let Self {
            split,
            total_record,
            result_rx,
            timeout,
        } = self;
        let mut outputs: Vec<Option<OutputRecord>> = vec![None; total_record];
        let mut received = 0;

        while received < total_record {
            let popped = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, result_rx.recv())
                    .await
                    .map_err(|_| Error::QueueTimeout {
                        split,
                        received,
                        expected: total_record,
                        timeout,
                    })?,
                None => result_rx.recv().await,
            };
            let raw = popped.map_err(|_| Error::QueueClosed {
                queue: "result",
                split,
            })??;

            if raw.split != split {
                return Err(Error::Collect {
                    split,
                    reason: format!("received a result of split {}", raw.split),
                });
            }
            if raw.len() > total_record - received {
                return Err(Error::Collect {
                    split,
                    reason: format!(
                        "received {} records but only {} remain expected",
                        raw.len(),
                        total_record - received
                    ),
                });
            }

            for output in decompose(raw)? {
                let slot = outputs.get_mut(output.rec_id).ok_or_else(|| Error::Collect {
                    split,
                    reason: format!(
                        "rec_id {} is out of range for {} records",
                        output.rec_id, total_record
                    ),
                })?;
                if slot.is_some() {
                    return Err(Error::Collect {
                        split,
                        reason: format!("rec_id {} is collected twice", output.rec_id),
                    });
                }
                *slot = Some(output);
                received += 1;
            }
        }

        // every slot is filled once the count is reached
        Ok(outputs.into_iter().flatten().collect())
    }
}

/// Split a result into per-record outputs and map the boxes back to
/// original image coordinates.
fn decompose(raw: RawResult) -> Result<Vec<OutputRecord>> {
    let RawResult {
        split,
        rec_id,
        im_id,
        im_info,
        boxes,
        scores,
    } = raw;
    let rec_ids = rec_id.decode("rec_id")?;
    let im_ids = im_id.decode("im_id")?;
    let num_records = im_info.nrows();

    let malformed = |reason: String| Error::Collect { split, reason };

    if im_info.ncols() != 3 {
        return Err(malformed(format!(
            "im_info must have 3 columns, but get {}",
            im_info.ncols()
        )));
    }
    if rec_ids.len() != num_records || im_ids.len() != num_records {
        return Err(malformed(format!(
            "{} rec_ids and {} im_ids for {} records",
            rec_ids.len(),
            im_ids.len(),
            num_records
        )));
    }

    izip!(rec_ids, im_ids, im_info.outer_iter(), boxes, scores)
        .map(|(rec_id, im_id, info, bbox, score)| -> Result<_> {
            let rec_id = usize::try_from(rec_id)
                .map_err(|_| malformed(format!("rec_id {} does not fit in usize", rec_id)))?;
            let im_info = [info[0], info[1], info[2]];
            let scale = im_info[2];

            if !(scale.is_finite() && scale > 0.0) {
                return Err(malformed(format!(
                    "invalid scale {} of rec_id {}",
                    scale, rec_id
                )));
            }
            if bbox.nrows() != score.nrows() {
                return Err(malformed(format!(
                    "rec_id {} has {} boxes but {} scores",
                    rec_id,
                    bbox.nrows(),
                    score.nrows()
                )));
            }

            Ok(OutputRecord {
                rec_id,
                im_id,
                im_info,
                bbox_xyxy: bbox / scale,
                cls_score: score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityTransport;
    use ndarray::array;

    fn raw(split: usize, rec_ids: &[u64], im_ids: &[u64], scale: f32) -> RawResult {
        let num = rec_ids.len();
        RawResult {
            split,
            rec_id: IdentityTransport::Int64.encode("rec_id", rec_ids).unwrap(),
            im_id: IdentityTransport::Float64.encode("im_id", im_ids).unwrap(),
            im_info: Array2::from_shape_fn((num, 3), |(_, col)| [100.0, 200.0, scale][col]),
            boxes: (0..num).map(|_| array![[2.0, 4.0, 6.0, 8.0]]).collect(),
            scores: (0..num).map(|_| array![[0.5]]).collect(),
        }
    }

    #[tokio::test]
    async fn collect_counts_records_and_rescales() -> Result<()> {
        let (tx, rx) = async_channel::unbounded();
        tx.send(Ok(raw(0, &[2], &[12], 2.0))).await.unwrap();
        tx.send(Ok(raw(0, &[0, 1], &[10, 11], 2.0))).await.unwrap();

        let outputs = Collector {
            split: 0,
            total_record: 3,
            result_rx: &rx,
            timeout: None,
        }
        .collect()
        .await?;

        assert_eq!(
            outputs.iter().map(|out| (out.rec_id, out.im_id)).collect::<Vec<_>>(),
            vec![(0, 10), (1, 11), (2, 12)]
        );
        assert_eq!(outputs[0].bbox_xyxy, array![[1.0f32, 2.0, 3.0, 4.0]]);
        assert_eq!(outputs[0].im_info, [100.0, 200.0, 2.0]);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_rec_id_is_fatal() {
        let (tx, rx) = async_channel::unbounded();
        tx.send(Ok(raw(0, &[1], &[10], 1.0))).await.unwrap();
        tx.send(Ok(raw(0, &[1], &[10], 1.0))).await.unwrap();

        let result = Collector {
            split: 0,
            total_record: 2,
            result_rx: &rx,
            timeout: None,
        }
        .collect()
        .await;
        assert!(matches!(result, Err(Error::Collect { split: 0, .. })));
    }

    #[tokio::test]
    async fn out_of_range_rec_id_is_fatal() {
        let (tx, rx) = async_channel::unbounded();
        tx.send(Ok(raw(0, &[5], &[10], 1.0))).await.unwrap();

        let result = Collector {
            split: 0,
            total_record: 2,
            result_rx: &rx,
            timeout: None,
        }
        .collect()
        .await;
        assert!(matches!(result, Err(Error::Collect { .. })));
    }

    #[tokio::test]
    async fn zero_scale_is_rejected() {
        let (tx, rx) = async_channel::unbounded();
        tx.send(Ok(raw(0, &[0], &[10], 0.0))).await.unwrap();

        let result = Collector {
            split: 0,
            total_record: 1,
            result_rx: &rx,
            timeout: None,
        }
        .collect()
        .await;
        assert!(matches!(result, Err(Error::Collect { .. })));
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (tx, rx) = async_channel::unbounded::<Result<RawResult>>();
        drop(tx);

        let result = Collector {
            split: 3,
            total_record: 1,
            result_rx: &rx,
            timeout: None,
        }
        .collect()
        .await;
        assert!(matches!(
            result,
            Err(Error::QueueClosed {
                queue: "result",
                split: 3
            })
        ));
    }

    #[tokio::test]
    async fn empty_split_needs_no_results() -> Result<()> {
        let (_tx, rx) = async_channel::unbounded();
        let outputs = Collector {
            split: 0,
            total_record: 0,
            result_rx: &rx,
            timeout: Some(Duration::from_millis(10)),
        }
        .collect()
        .await?;
        assert!(outputs.is_empty());
        Ok(())
    }
}
