use super::Rect;
use crate::common::*;

/// Bounding box in TLBR format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> Rect for TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        self.t
    }

    fn l(&self) -> Self::Type {
        self.l
    }

    fn b(&self) -> Self::Type {
        self.b
    }

    fn r(&self) -> Self::Type {
        self.r
    }

    fn h(&self) -> Self::Type {
        self.b - self.t
    }

    fn w(&self) -> Self::Type {
        self.r - self.l
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");

        Ok(Self { t, l, b, r })
    }
}

/// Convert corner form `[x0, y0, x1, y1]` to `[x, y, w, h]` with inclusive
/// pixel extents.
///
/// No ordering check is done on the corners, so a degenerate box maps to a
/// non-positive extent instead of failing.
pub fn xyxy_to_xywh_inclusive<T>(xyxy: [T; 4]) -> [T; 4]
where
    T: Copy + Num,
{
    let [x0, y0, x1, y1] = xyxy;
    let one = T::one();
    [x0, y0, x1 - x0 + one, y1 - y0 + one]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_box_at_origin() {
        assert_eq!(xyxy_to_xywh_inclusive([0.0, 0.0, 0.0, 0.0]), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn inclusive_extent() {
        let xywh = xyxy_to_xywh_inclusive([3.0f32, 5.0, 10.0, 20.0]);
        assert_eq!(xywh, [3.0, 5.0, 8.0, 16.0]);
    }

    #[test]
    fn tlbr_rejects_inverted_corners() {
        let tlbr = TLBR::try_from_tlbr([2, 1, 8, 4]).unwrap();
        assert_eq!([tlbr.t(), tlbr.l(), tlbr.b(), tlbr.r()], [2, 1, 8, 4]);
        assert_eq!((tlbr.h(), tlbr.w()), (6, 3));
        assert!(TLBR::try_from_tlbr([8, 1, 2, 4]).is_err());
    }
}
