use crate::common::*;

/// Named area range in squared pixels, `[min, max]` inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRange {
    pub name: String,
    pub range: [f64; 2],
}

impl AreaRange {
    pub fn contains(&self, area: f64) -> bool {
        let [min, max] = self.range;
        area >= min && area <= max
    }
}

/// Evaluation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub iou_thresholds: Vec<f64>,
    pub max_dets: Vec<usize>,
    pub area_ranges: Vec<AreaRange>,
}

impl Params {
    pub fn with_max_dets(max_dets: Vec<usize>) -> Result<Self> {
        let params = Self {
            max_dets,
            ..Default::default()
        };
        params.check()?;
        Ok(params)
    }

    pub fn check(&self) -> Result<()> {
        ensure!(!self.max_dets.is_empty(), "max_dets must not be empty");
        ensure!(
            self.max_dets.iter().all(|&max_det| max_det > 0),
            "max_dets must be positive"
        );
        ensure!(
            !self.iou_thresholds.is_empty(),
            "iou_thresholds must not be empty"
        );
        ensure!(
            self.iou_thresholds
                .iter()
                .all(|&thresh| (0.0..=1.0).contains(&thresh)),
            "iou thresholds must be within [0, 1]"
        );
        ensure!(!self.area_ranges.is_empty(), "area_ranges must not be empty");
        Ok(())
    }

    pub fn max_det_limit(&self) -> usize {
        self.max_dets.iter().copied().max().unwrap_or(0)
    }
}

impl Default for Params {
    fn default() -> Self {
        let iou_thresholds = (0..10).map(|step| 0.5 + 0.05 * step as f64).collect();
        let area_ranges = [
            ("all", [0.0, 1e10]),
            ("small", [0.0, 32.0 * 32.0]),
            ("medium", [32.0 * 32.0, 96.0 * 96.0]),
            ("large", [96.0 * 96.0, 1e10]),
        ]
        .into_iter()
        .map(|(name, range)| AreaRange {
            name: name.into(),
            range,
        })
        .collect();

        Self {
            iou_thresholds,
            max_dets: vec![1, 10, 100],
            area_ranges,
        }
    }
}
