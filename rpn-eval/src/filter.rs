//! Post-filters over the collected outputs of a split.

use crate::{common::*, pipeline::OutputRecord, record::Record};

/// A callback over the outputs of one split.
///
/// `records` is indexed by `rec_id`. Filters run in registration order.
/// Any `Fn(Vec<OutputRecord>, &[Record]) -> Fallible<Vec<OutputRecord>>`
/// closure is a filter.
pub trait OutputFilter
where
    Self: Send + Sync,
{
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn apply(&self, outputs: Vec<OutputRecord>, records: &[Record]) -> Fallible<Vec<OutputRecord>>;
}

impl<F> OutputFilter for F
where
    F: Fn(Vec<OutputRecord>, &[Record]) -> Fallible<Vec<OutputRecord>> + Send + Sync,
{
    fn apply(&self, outputs: Vec<OutputRecord>, records: &[Record]) -> Fallible<Vec<OutputRecord>> {
        self(outputs, records)
    }
}

/// Gives a filter, typically a closure, the name reported on failure.
#[derive(Debug, Clone)]
pub struct Named<F> {
    name: String,
    filter: F,
}

impl<F> Named<F>
where
    F: OutputFilter,
{
    pub fn new(name: impl Into<String>, filter: F) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }
}

impl<F> OutputFilter for Named<F>
where
    F: OutputFilter,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, outputs: Vec<OutputRecord>, records: &[Record]) -> Fallible<Vec<OutputRecord>> {
        self.filter.apply(outputs, records)
    }
}

/// Run the filters one after another.
pub fn apply_filters(
    split: usize,
    filters: &[Box<dyn OutputFilter>],
    outputs: Vec<OutputRecord>,
    records: &[Record],
) -> Result<Vec<OutputRecord>> {
    filters.iter().try_fold(outputs, |outputs, filter| {
        filter
            .apply(outputs, records)
            .map_err(|err| Error::Filter {
                split,
                name: filter.name().to_string(),
                source: err.into(),
            })
    })
}

fn record_of<'a>(records: &'a [Record], output: &OutputRecord) -> Fallible<&'a Record> {
    records.get(output.rec_id).ok_or_else(|| {
        format_err!(
            "rec_id {} is out of range for {} records",
            output.rec_id,
            records.len()
        )
    })
}

/// Clips boxes into the extent of the source image.
#[derive(Debug, Clone, Default)]
pub struct ClipToImage;

impl OutputFilter for ClipToImage {
    fn name(&self) -> &str {
        "clip_to_image"
    }

    fn apply(&self, outputs: Vec<OutputRecord>, records: &[Record]) -> Fallible<Vec<OutputRecord>> {
        outputs
            .into_iter()
            .map(|mut output| -> Fallible<_> {
                let record = record_of(records, &output)?;
                let max_x = record.width.saturating_sub(1) as f32;
                let max_y = record.height.saturating_sub(1) as f32;

                // columns alternate between x and y coordinates
                for (index, mut column) in output.bbox_xyxy.columns_mut().into_iter().enumerate() {
                    let max = if index % 2 == 0 { max_x } else { max_y };
                    column.mapv_inplace(|value| value.max(0.0).min(max));
                }
                Ok(output)
            })
            .collect()
    }
}

/// Drops boxes whose inclusive width or height is below `min_size` pixels.
#[derive(Debug, Clone)]
pub struct MinSize {
    min_size: f32,
}

impl MinSize {
    pub fn new(min_size: R64) -> Fallible<Self> {
        ensure!(min_size >= 0.0, "min_size must be non-negative");
        Ok(Self {
            min_size: min_size.raw() as f32,
        })
    }
}

impl OutputFilter for MinSize {
    fn name(&self) -> &str {
        "min_size"
    }

    fn apply(&self, outputs: Vec<OutputRecord>, _records: &[Record]) -> Fallible<Vec<OutputRecord>> {
        outputs
            .into_iter()
            .map(|output| -> Fallible<_> {
                let OutputRecord {
                    bbox_xyxy,
                    cls_score,
                    ..
                } = &output;
                ensure!(
                    bbox_xyxy.ncols() >= 4,
                    "rec_id {} has {} box columns, expect at least 4",
                    output.rec_id,
                    bbox_xyxy.ncols()
                );

                let keep: Vec<usize> = bbox_xyxy
                    .outer_iter()
                    .enumerate()
                    .filter(|(_, row)| {
                        let [_, _, w, h] =
                            bbox::xyxy_to_xywh_inclusive([row[0], row[1], row[2], row[3]]);
                        w >= self.min_size && h >= self.min_size
                    })
                    .map(|(index, _)| index)
                    .collect();

                if keep.len() == bbox_xyxy.nrows() {
                    return Ok(output);
                }

                let bbox_xyxy = bbox_xyxy.select(Axis(0), &keep);
                let cls_score = cls_score.select(Axis(0), &keep);
                Ok(OutputRecord {
                    bbox_xyxy,
                    cls_score,
                    ..output
                })
            })
            .collect()
    }
}
