//! ABOUTME: Bounded per-source collection context and the sink collectors write into
//! ABOUTME: Every per-source call carries a deadline and the scrape's cancellation signal

use dx_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::labels::LabelInjector;
use crate::sample::MetricSample;

/// Deadline and cancellation for one source within one scrape
#[derive(Debug, Clone)]
pub struct CollectContext {
    datasource: String,
    deadline: Instant,
    cancel: CancellationToken,
}

impl CollectContext {
    /// Fresh context whose cancellation follows `parent`
    pub fn new(datasource: impl Into<String>, timeout: Duration, parent: &CancellationToken) -> Self {
        Self {
            datasource: datasource.into(),
            deadline: Instant::now() + timeout,
            cancel: parent.child_token(),
        }
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` until it finishes, the deadline passes, or the scrape is cancelled
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(Error::Cancelled(format!("{}: scrape cancelled", self.datasource)))
            }
            result = timeout_at(self.deadline, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout(format!(
                    "{}: collection exceeded its deadline",
                    self.datasource
                ))),
            },
        }
    }
}

/// Bounded channel end collectors push samples into
///
/// A sink built with [`MetricSink::with_injector`] stamps the source's labels
/// onto each sample before it is queued.
#[derive(Debug, Clone)]
pub struct MetricSink {
    tx: mpsc::Sender<MetricSample>,
    injector: Option<Arc<LabelInjector>>,
}

impl MetricSink {
    pub fn new(tx: mpsc::Sender<MetricSample>) -> Self {
        Self { tx, injector: None }
    }

    /// Sink and receiver pair with room for `capacity` samples
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MetricSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn with_injector(mut self, injector: Arc<LabelInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Queue a sample, waiting while the buffer is full
    pub async fn send(&self, sample: MetricSample) -> Result<()> {
        let sample = match &self.injector {
            Some(injector) => injector.wrap(sample),
            None => sample,
        };
        self.tx
            .send(sample)
            .await
            .map_err(|_| Error::Cancelled("metric stream closed".to_string()))
    }
}
