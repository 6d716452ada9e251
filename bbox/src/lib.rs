//! Safe bounding box types and functions.

mod common;

pub use rect::*;
pub mod rect;

pub use tlbr::*;
pub mod tlbr;

pub use xywh::*;
pub mod xywh;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
