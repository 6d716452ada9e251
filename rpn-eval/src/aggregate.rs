//! Fan-in of detections that belong to the same image.

use crate::{common::*, pipeline::OutputRecord};

/// All detections of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedEntry {
    pub bbox_xyxy: Array2<f32>,
    pub cls_score: Array2<f32>,
}

impl AggregatedEntry {
    pub fn num_detections(&self) -> usize {
        self.bbox_xyxy.nrows()
    }
}

/// Groups outputs by `im_id` in first-seen order.
#[derive(Debug, Default)]
pub struct Aggregator {
    contributors: IndexMap<u64, Vec<(Array2<f32>, Array2<f32>)>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, output: OutputRecord) -> Result<()> {
        let OutputRecord {
            im_id,
            rec_id,
            bbox_xyxy,
            cls_score,
            ..
        } = output;

        if bbox_xyxy.nrows() != cls_score.nrows() {
            return Err(Error::Aggregate {
                im_id,
                reason: format!(
                    "rec_id {} has {} boxes but {} scores",
                    rec_id,
                    bbox_xyxy.nrows(),
                    cls_score.nrows()
                ),
            });
        }

        self.contributors
            .entry(im_id)
            .or_default()
            .push((bbox_xyxy, cls_score));
        Ok(())
    }

    /// Concatenate the contributors of each image along the row axis, in
    /// the order they were pushed.
    pub fn finish(self) -> Result<IndexMap<u64, AggregatedEntry>> {
        self.contributors
            .into_iter()
            .map(|(im_id, mut contributors)| -> Result<_> {
                let entry = if contributors.len() == 1 {
                    let (bbox_xyxy, cls_score) = contributors.remove(0);
                    AggregatedEntry {
                        bbox_xyxy,
                        cls_score,
                    }
                } else {
                    let concat = |arrays: Vec<ArrayView2<f32>>, name: &str| {
                        concatenate(Axis(0), &arrays).map_err(|err| Error::Aggregate {
                            im_id,
                            reason: format!("cannot concatenate {}: {}", name, err),
                        })
                    };
                    let (boxes, scores): (Vec<_>, Vec<_>) = contributors
                        .iter()
                        .map(|(bbox, score)| (bbox.view(), score.view()))
                        .unzip();

                    AggregatedEntry {
                        bbox_xyxy: concat(boxes, "boxes")?,
                        cls_score: concat(scores, "scores")?,
                    }
                };
                Ok((im_id, entry))
            })
            .collect()
    }
}

/// Merge the outputs of a split per image.
pub fn aggregate<I>(outputs: I) -> Result<IndexMap<u64, AggregatedEntry>>
where
    I: IntoIterator<Item = OutputRecord>,
{
    let mut aggregator = Aggregator::new();
    for output in outputs {
        aggregator.push(output)?;
    }
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn output(
        rec_id: usize,
        im_id: u64,
        bbox_xyxy: Array2<f32>,
        cls_score: Array2<f32>,
    ) -> OutputRecord {
        OutputRecord {
            rec_id,
            im_id,
            im_info: [100.0, 100.0, 1.0],
            bbox_xyxy,
            cls_score,
        }
    }

    fn rows(num: usize, base: f32) -> (Array2<f32>, Array2<f32>) {
        let boxes = Array2::from_shape_fn((num, 4), |(row, col)| base + row as f32 + col as f32);
        let scores = Array2::from_shape_fn((num, 1), |(row, _)| base + row as f32);
        (boxes, scores)
    }

    #[test]
    fn contributors_concatenate_in_order() -> Result<()> {
        let (boxes_a, scores_a) = rows(3, 0.0);
        let (boxes_b, scores_b) = rows(2, 100.0);
        let entries = aggregate(vec![
            output(0, 7, boxes_a, scores_a),
            output(1, 8, Array2::zeros((0, 4)), Array2::zeros((0, 1))),
            output(2, 7, boxes_b, scores_b),
        ])?;

        assert_eq!(entries.keys().copied().collect::<Vec<_>>(), vec![7, 8]);
        let entry = &entries[&7];
        assert_eq!(entry.num_detections(), 5);
        assert_eq!(
            entry.cls_score.column(0).to_vec(),
            vec![0.0, 1.0, 2.0, 100.0, 101.0]
        );
        assert_eq!(entry.bbox_xyxy.row(3).to_vec(), vec![100.0, 101.0, 102.0, 103.0]);
        assert_eq!(entries[&8].num_detections(), 0);
        Ok(())
    }

    #[test]
    fn single_contributor_is_kept_as_is() -> Result<()> {
        let (boxes, scores) = rows(4, 1.0);
        let entries = aggregate(vec![output(0, 3, boxes.clone(), scores.clone())])?;
        assert_eq!(
            entries[&3],
            AggregatedEntry {
                bbox_xyxy: boxes,
                cls_score: scores
            }
        );
        Ok(())
    }

    #[test]
    fn misaligned_rows_are_rejected() {
        let result = aggregate(vec![output(0, 1, Array2::zeros((2, 4)), array![[0.5]])]);
        assert!(matches!(result, Err(Error::Aggregate { im_id: 1, .. })));
    }

    #[test]
    fn content_does_not_depend_on_arrival_order() -> Result<()> {
        let make = || {
            (0..4).map(|rec_id| {
                let (boxes, scores) = rows(rec_id + 1, rec_id as f32 * 10.0);
                output(rec_id, rec_id as u64 % 2, boxes, scores)
            })
        };
        let forward = aggregate(make())?;
        let backward = aggregate(make().rev())?;

        for (im_id, entry) in &forward {
            let other = &backward[im_id];
            let mut lhs = entry.cls_score.column(0).to_vec();
            let mut rhs = other.cls_score.column(0).to_vec();
            lhs.sort_by(f32::total_cmp);
            rhs.sort_by(f32::total_cmp);
            assert_eq!(lhs, rhs);
        }
        Ok(())
    }
}
