use crate::metrics::MetricTable;
use std::{
    future::Future,
    pin::Pin,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// A device to poll, together with the polling group that lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub device_id: String,
    pub group: String,
}

impl Target {
    pub fn new(device_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            group: group.into(),
        }
    }
}

/// Result of polling one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub device_id: String,
    pub points: MetricTable,
    /// Catalog entries that failed or were never fetched.
    pub missing: usize,
    pub attempted: usize,
}

impl Collection {
    pub fn empty(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }
}

/// Why a single catalog entry could not be read.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("{0} is not supported by the device")]
    Unsupported(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("unreadable reply: {0}")]
    Malformed(String),
    #[error("{0} is not installed")]
    ToolMissing(&'static str),
    #[error("collection cancelled")]
    Cancelled,
    #[error("failed to run protocol tool: {0}")]
    Io(#[from] std::io::Error),
}

/// A protocol specific source of metric points.
pub trait DeviceCollector: Send + Sync {
    /// Short protocol name used in logs.
    fn name(&self) -> &'static str;

    /// Every target the configuration asks this collector to poll.
    fn targets(&self) -> Vec<Target>;

    /// Polls one target through the whole catalog.
    ///
    /// Never fails as a whole: entries that cannot be read are counted in
    /// [`Collection::missing`].
    fn collect<'a>(
        &'a self,
        target: &'a Target,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Collection> + Send + 'a>>;
}
