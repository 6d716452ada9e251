//! Conversion of aggregated detections into COCO style results.

use crate::{aggregate::AggregatedEntry, common::*};

/// One detection in the COCO result format.
///
/// Fields are declared in key order so the serialized object is key-sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// `[x, y, w, h]` with inclusive extents.
    pub bbox: [f64; 4],
    pub category_id: u64,
    pub image_id: u64,
    pub score: f64,
}

impl From<&DetectionResult> for coco_recall::Detection {
    fn from(from: &DetectionResult) -> Self {
        let DetectionResult {
            bbox,
            category_id,
            image_id,
            score,
        } = *from;
        Self {
            image_id,
            category_id,
            bbox,
            score,
        }
    }
}

/// The append-only list of results of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCollection {
    results: Vec<DetectionResult>,
}

impl ResultCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DetectionResult> {
        self.results.iter()
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = DetectionResult>) {
        self.results.extend(results);
    }

    pub fn as_slice(&self) -> &[DetectionResult] {
        &self.results
    }

    /// Convert to the input of the recall scorer.
    pub fn to_detections(&self) -> Vec<coco_recall::Detection> {
        self.results.iter().map(Into::into).collect()
    }
}

/// Sorts, truncates and converts the detections of each image.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    max_dets: usize,
    category_id: u64,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self {
            max_dets: 100,
            category_id: 1,
        }
    }
}

impl PostProcessor {
    pub fn new(max_dets: NonZeroUsize, category_id: u64) -> Self {
        Self {
            max_dets: max_dets.get(),
            category_id,
        }
    }

    /// Append the results of every image to the collection.
    ///
    /// Images without detections contribute nothing.
    pub fn process(
        &self,
        entries: IndexMap<u64, AggregatedEntry>,
        collection: &mut ResultCollection,
    ) -> Result<()> {
        for (im_id, entry) in entries {
            collection.extend(self.process_image(im_id, &entry)?);
        }
        Ok(())
    }

    /// Keep the `max_dets` highest scoring detections of one image.
    ///
    /// The sort is stable and ascending, so among equal scores the later row
    /// survives the cut. Results stay in ascending score order.
    pub fn process_image(
        &self,
        im_id: u64,
        entry: &AggregatedEntry,
    ) -> Result<Vec<DetectionResult>> {
        let AggregatedEntry {
            bbox_xyxy,
            cls_score,
        } = entry;
        let num_dets = bbox_xyxy.nrows();

        if num_dets == 0 {
            return Ok(vec![]);
        }

        let invalid = |reason: String| Error::Postprocess { im_id, reason };

        if cls_score.nrows() != num_dets {
            return Err(invalid(format!(
                "{} boxes but {} scores",
                num_dets,
                cls_score.nrows()
            )));
        }
        if bbox_xyxy.ncols() < 4 || cls_score.ncols() < 1 {
            return Err(invalid(format!(
                "expect at least 4 box columns and 1 score column, but get {} and {}",
                bbox_xyxy.ncols(),
                cls_score.ncols()
            )));
        }

        let scores = cls_score.column(0);
        if let Some(row) = scores.iter().position(|score| score.is_nan()) {
            return Err(invalid(format!("score of row {} is NaN", row)));
        }

        let mut order: Vec<usize> = (0..num_dets).collect();
        order.sort_by(|&lhs, &rhs| scores[lhs].total_cmp(&scores[rhs]));
        let keep = &order[num_dets.saturating_sub(self.max_dets)..];

        let results = keep
            .iter()
            .map(|&row| {
                let xyxy = [
                    bbox_xyxy[[row, 0]],
                    bbox_xyxy[[row, 1]],
                    bbox_xyxy[[row, 2]],
                    bbox_xyxy[[row, 3]],
                ];
                let xywh = bbox::xyxy_to_xywh_inclusive(xyxy).map(|value| value as f64);

                DetectionResult {
                    bbox: xywh,
                    category_id: self.category_id,
                    image_id: im_id,
                    score: scores[row] as f64,
                }
            })
            .collect();

        Ok(results)
    }
}
