//! Class-agnostic proposal recall evaluation against COCO ground truth.

mod common;
pub mod eval;
pub mod ground_truth;
pub mod params;

pub use eval::*;
pub use ground_truth::*;
pub use params::*;
