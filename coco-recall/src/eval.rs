use crate::{
    common::*,
    ground_truth::{Detection, GroundTruth},
    params::Params,
};
use bbox::{prelude::*, XYWH};

/// Per-image matching result for one area range.
#[derive(Debug, Clone)]
pub struct EvalImage {
    pub image_id: u64,
    pub area_index: usize,
    /// Number of ground truth boxes that count towards recall.
    pub num_gt: usize,
    /// `det_matched[t][d]` is set if the `d`-th best detection matched a
    /// ground truth box at the `t`-th IoU threshold.
    pub det_matched: Vec<Vec<bool>>,
}

/// Accumulated recall table indexed by `[iou][area][max_det]`.
///
/// A negative value marks a cell without any ground truth.
#[derive(Debug, Clone)]
pub struct Accumulated {
    pub recall: Vec<Vec<Vec<f64>>>,
}

/// One line of the summary report.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// A single IoU threshold, or `None` for the mean over all thresholds.
    pub iou: Option<f64>,
    pub area: String,
    pub max_dets: usize,
    pub value: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iou = match self.iou {
            Some(iou) => format!("{:0.2}", iou),
            None => "0.50:0.95".to_string(),
        };
        write!(
            f,
            " Average Recall     (AR) @[ IoU={:<9} | area={:>6} | maxDets={:>3} ] = {:0.3}",
            iou, self.area, self.max_dets, self.value
        )
    }
}

/// Class-agnostic recall evaluation of proposals.
///
/// The stages must run in the order `evaluate`, `accumulate`, `summarize`.
#[derive(Debug)]
pub struct RecallEval<'a> {
    gt: &'a GroundTruth,
    detections: HashMap<u64, Vec<Detection>>,
    params: Params,
    eval_images: Option<Vec<EvalImage>>,
    accumulated: Option<Accumulated>,
}

impl<'a> RecallEval<'a> {
    pub fn new(gt: &'a GroundTruth, detections: Vec<Detection>, params: Params) -> Result<Self> {
        params.check()?;
        let detections = gt.load_results(detections)?;

        Ok(Self {
            gt,
            detections,
            params,
            eval_images: None,
            accumulated: None,
        })
    }

    /// Match detections to ground truth boxes per image and area range.
    pub fn evaluate(&mut self) -> Result<&[EvalImage]> {
        let max_det = self.params.max_det_limit();
        let mut eval_images = vec![];

        for image_id in self.gt.image_ids() {
            let detections: Vec<XYWH<f64>> = {
                let mut dets: Vec<&Detection> = self
                    .detections
                    .get(&image_id)
                    .map(|dets| dets.iter().collect())
                    .unwrap_or_default();
                // stable, so equal scores keep submission order
                dets.sort_by(|lhs, rhs| rhs.score.total_cmp(&lhs.score));
                dets.into_iter()
                    .take(max_det)
                    .map(|det| {
                        let [x, y, w, h] = det.bbox;
                        XYWH::try_from_xywh([x, y, w.max(0.0), h.max(0.0)])
                    })
                    .try_collect()?
            };
            let annotations = self.gt.annotations(image_id);

            for (area_index, area_range) in self.params.area_ranges.iter().enumerate() {
                let gt_boxes: Vec<XYWH<f64>> = annotations
                    .iter()
                    .filter(|ann| !ann.is_crowd() && area_range.contains(ann.area()))
                    .map(|ann| ann.rect())
                    .try_collect()?;

                let det_matched = self
                    .params
                    .iou_thresholds
                    .iter()
                    .map(|&thresh| match_greedy(&detections, &gt_boxes, thresh))
                    .collect();

                eval_images.push(EvalImage {
                    image_id,
                    area_index,
                    num_gt: gt_boxes.len(),
                    det_matched,
                });
            }
        }

        self.accumulated = None;
        Ok(self.eval_images.insert(eval_images))
    }

    /// Aggregate per-image matches into the recall table.
    pub fn accumulate(&mut self) -> Result<&Accumulated> {
        let eval_images = self
            .eval_images
            .as_ref()
            .ok_or_else(|| format_err!("evaluate() must be called before accumulate()"))?;
        let Params {
            ref iou_thresholds,
            ref area_ranges,
            ref max_dets,
        } = self.params;

        let recall = (0..iou_thresholds.len())
            .map(|iou_index| {
                (0..area_ranges.len())
                    .map(|area_index| {
                        let images: Vec<_> = eval_images
                            .iter()
                            .filter(|image| image.area_index == area_index)
                            .collect();
                        let num_gt: usize = images.iter().map(|image| image.num_gt).sum();

                        max_dets
                            .iter()
                            .map(|&max_det| {
                                if num_gt == 0 {
                                    return -1.0;
                                }
                                let num_tp: usize = images
                                    .iter()
                                    .map(|image| {
                                        image.det_matched[iou_index]
                                            .iter()
                                            .take(max_det)
                                            .filter(|&&matched| matched)
                                            .count()
                                    })
                                    .sum();
                                num_tp as f64 / num_gt as f64
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();

        Ok(self.accumulated.insert(Accumulated { recall }))
    }

    /// Produce the recall report, one line per (IoU, area, max_dets) cell of
    /// interest.
    pub fn summarize(&self) -> Result<Vec<Summary>> {
        let Accumulated { recall } = self
            .accumulated
            .as_ref()
            .ok_or_else(|| format_err!("accumulate() must be called before summarize()"))?;
        let Params {
            ref iou_thresholds,
            ref area_ranges,
            ref max_dets,
        } = self.params;
        let last_max_det = max_dets.len() - 1;

        let mean_recall = |iou: Option<f64>, area_index: usize, max_det_index: usize| {
            let values: Vec<f64> = iou_thresholds
                .iter()
                .enumerate()
                .filter(|(_, &thresh)| iou.map(|iou| (iou - thresh).abs() < 1e-9).unwrap_or(true))
                .map(|(iou_index, _)| recall[iou_index][area_index][max_det_index])
                .filter(|&value| value >= 0.0)
                .collect();

            let value = if values.is_empty() {
                -1.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            };

            Summary {
                iou,
                area: area_ranges[area_index].name.clone(),
                max_dets: max_dets[max_det_index],
                value,
            }
        };

        let mut lines: Vec<_> = (0..max_dets.len())
            .map(|max_det_index| mean_recall(None, 0, max_det_index))
            .collect();
        lines.extend(
            [0.5, 0.75]
                .into_iter()
                .filter(|iou| iou_thresholds.iter().any(|thresh| (thresh - iou).abs() < 1e-9))
                .map(|iou| mean_recall(Some(iou), 0, last_max_det)),
        );
        lines.extend((1..area_ranges.len()).map(|area_index| mean_recall(None, area_index, last_max_det)));

        lines.iter().for_each(|line| info!("{}", line));
        Ok(lines)
    }
}

/// Greedily match detections, best first, to the unmatched ground truth box
/// with the highest IoU not below `thresh`.
fn match_greedy(detections: &[XYWH<f64>], gt_boxes: &[XYWH<f64>], thresh: f64) -> Vec<bool> {
    let mut gt_matched = vec![false; gt_boxes.len()];

    detections
        .iter()
        .map(|det| {
            let best = gt_boxes
                .iter()
                .enumerate()
                .filter(|(gt_index, _)| !gt_matched[*gt_index])
                .map(|(gt_index, gt)| (gt_index, det.iou_with(gt, 0.0)))
                .filter(|&(_, iou)| iou >= thresh)
                .max_by(|(_, lhs), (_, rhs)| lhs.total_cmp(rhs));

            match best {
                Some((gt_index, _)) => {
                    gt_matched[gt_index] = true;
                    true
                }
                None => false,
            }
        })
        .collect()
}
