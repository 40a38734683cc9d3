//! ABOUTME: Collector traits for single-source logic and scrape-level collectors
//! ABOUTME: The exporter only ever talks to the top-level trait

use async_trait::async_trait;
use dx_core::Result;
use tokio_util::sync::CancellationToken;

use crate::context::{CollectContext, MetricSink};
use crate::sample::MetricDesc;

/// Collection logic bound to one database handle
#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn describe(&self) -> Vec<MetricDesc>;

    /// Emit this source's samples into `sink`, honouring `ctx`
    async fn collect(&self, ctx: &CollectContext, sink: &MetricSink) -> Result<()>;
}

/// Anything the exporter runs on every scrape
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn describe(&self) -> Vec<MetricDesc> {
        Vec::new()
    }

    /// Emit samples until done; returning closes this collector's part of the stream
    async fn collect(&self, cancel: CancellationToken, sink: MetricSink) -> Result<()>;
}
