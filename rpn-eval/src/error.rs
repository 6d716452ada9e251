//! Errors of the evaluation pipeline.
//!
//! Every variant except the I/O ones names the split (and, where known, the
//! records and device) that triggered it, so a failing run can be reproduced.

use crate::{common::BoxError, identity::IdentityTransport, model::Device};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{field} value {value} is out of the exact integer range of {transport} transport")]
    IdentityOverflow {
        field: &'static str,
        value: String,
        transport: IdentityTransport,
    },

    #[error("failed to load model on device {device}")]
    ModelLoad {
        device: Device,
        #[source]
        source: BoxError,
    },

    #[error("inference failed on device {device} in split {split} for records {rec_ids:?}")]
    Inference {
        device: Device,
        split: usize,
        rec_ids: Vec<u64>,
        #[source]
        source: BoxError,
    },

    #[error("no result arrived within {timeout:?} in split {split} ({received} of {expected} records collected)")]
    QueueTimeout {
        split: usize,
        received: usize,
        expected: usize,
        timeout: Duration,
    },

    #[error("failed to prepare records of split {split}")]
    Records {
        split: usize,
        #[source]
        source: BoxError,
    },

    #[error("failed to load record {rec_id} (im_id {im_id}) in split {split}")]
    Loader {
        split: usize,
        rec_id: usize,
        im_id: u64,
        #[source]
        source: BoxError,
    },

    #[error("malformed result in split {split}: {reason}")]
    Collect { split: usize, reason: String },

    #[error("output filter '{name}' failed in split {split}")]
    Filter {
        split: usize,
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("cannot aggregate detections of im_id {im_id}: {reason}")]
    Aggregate { im_id: u64, reason: String },

    #[error("cannot convert detections of im_id {im_id}: {reason}")]
    Postprocess { im_id: u64, reason: String },

    #[error("{queue} queue closed unexpectedly in split {split}")]
    QueueClosed { queue: &'static str, split: usize },

    #[error("{task} task of split {split} panicked or was cancelled")]
    Join {
        task: &'static str,
        split: usize,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
