use bytes::Bytes;

use crate::error::Result;
use crate::models::SessionSummary;
use crate::upscaler::HealthStatus;

/// The external upscaling engine, seen from the queue worker.
#[async_trait::async_trait]
pub trait UpscaleService: Send + Sync {
    async fn health(&self) -> Result<HealthStatus>;

    /// Sends encoded image bytes and returns the upscaled image.
    async fn upscale(&self, image: Bytes, file_name: &str) -> Result<Bytes>;
}

/// Where page-session statistics go when the queue drains.
#[async_trait::async_trait]
pub trait StatsStore: Send + Sync {
    async fn record_session(&self, summary: &SessionSummary) -> Result<()>;
}
