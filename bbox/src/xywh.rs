use super::Rect;
use crate::common::*;

/// Bounding box in XYWH format, the layout used by COCO annotations.
///
/// As a [Rect], the box spans `[x, x + w)` and `[y, y + h)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XYWH<T> {
    pub(crate) x: T,
    pub(crate) y: T,
    pub(crate) w: T,
    pub(crate) h: T,
}

impl<T> XYWH<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_xywh(xywh: [T; 4]) -> Result<Self> {
        let [x, y, w, h] = xywh;
        let zero = T::zero();
        ensure!(w >= zero && h >= zero, "w and h must be non-negative");
        Ok(Self { x, y, w, h })
    }
}

impl<T> Rect for XYWH<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        self.y
    }

    fn l(&self) -> Self::Type {
        self.x
    }

    fn b(&self) -> Self::Type {
        self.y + self.h
    }

    fn r(&self) -> Self::Type {
        self.x + self.w
    }

    fn h(&self) -> Self::Type {
        self.h
    }

    fn w(&self) -> Self::Type {
        self.w
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");
        Ok(Self {
            x: l,
            y: t,
            w: r - l,
            h: b - t,
        })
    }
}
