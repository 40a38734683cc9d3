//! ABOUTME: Scrape entry point running every top-level collector into one bounded stream
//! ABOUTME: Renders the collected samples plus the exporter's own metrics as OpenMetrics text

use dx_config::LABEL_NAME_PATTERN;
use dx_core::{Error, MonotonicTimer, Result, ScrapeId};
use prometheus_client::collector::Collector as RegistryCollector;
use prometheus_client::encoding::text::{encode_eof, encode_registry};
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::metrics::counter::{ConstCounter, Counter};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::{ConstGauge, Gauge};
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::collector::Collector;
use crate::context::MetricSink;
use crate::sample::{MetricSample, MetricValue};
use crate::strategy::SourceErrorCounter;

/// The exporter's own metrics
#[derive(Debug, Clone)]
pub struct ExporterMetrics {
    pub scrape_duration: Histogram,
    pub scrapes: Counter,
    pub scrape_samples: Gauge,
    pub source_errors: SourceErrorCounter,
    pub collector_errors: Family<Vec<(String, String)>, Counter>,
}

impl ExporterMetrics {
    pub fn new() -> Self {
        Self {
            scrape_duration: Histogram::new(exponential_buckets(0.005, 2.0, 14)),
            scrapes: Counter::default(),
            scrape_samples: Gauge::default(),
            source_errors: Family::default(),
            collector_errors: Family::default(),
        }
    }

    pub fn register(&self, registry: &mut Registry, namespace: &str) {
        registry.register(
            format!("{}_exporter_scrape_duration_seconds", namespace),
            "Time spent collecting one scrape",
            self.scrape_duration.clone(),
        );
        registry.register(
            format!("{}_exporter_scrapes", namespace),
            "Total number of scrapes served",
            self.scrapes.clone(),
        );
        registry.register(
            format!("{}_exporter_scrape_samples", namespace),
            "Samples produced by the latest scrape",
            self.scrape_samples.clone(),
        );
        registry.register(
            format!("{}_exporter_source_errors", namespace),
            "Failed per-source collection attempts",
            self.source_errors.clone(),
        );
        registry.register(
            format!("{}_exporter_collector_errors", namespace),
            "Top-level collectors that returned an error",
            self.collector_errors.clone(),
        );
    }
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct SampleFamily {
    help: String,
    counter: bool,
    series: Vec<(Vec<(String, String)>, f64)>,
}

/// Escape a label value for the text exposition format
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Escape help text, which may not span lines
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Group samples by name, dropping kind conflicts, repeated label sets and
/// label names the exposition format cannot carry
fn group_samples(samples: Vec<MetricSample>) -> BTreeMap<String, SampleFamily> {
    let label_names = Regex::new(LABEL_NAME_PATTERN).ok();
    let mut families: BTreeMap<String, SampleFamily> = BTreeMap::new();
    let mut seen: HashSet<(String, Vec<(String, String)>)> = HashSet::new();

    for sample in samples {
        let counter = sample.value.is_counter();
        // Counters are exposed with a `_total` suffix added by the encoder
        let name = match sample.value {
            MetricValue::Counter(_) => sample
                .name
                .strip_suffix("_total")
                .unwrap_or(&sample.name)
                .to_string(),
            MetricValue::Gauge(_) => sample.name.clone(),
        };

        if let Some(re) = &label_names {
            if let Some((key, _)) = sample.labels.iter().find(|(k, _)| !re.is_match(k)) {
                warn!(metric = %name, label = %key, "Dropping sample with an invalid label name");
                continue;
            }
        }

        let family = families.entry(name.clone()).or_insert_with(|| SampleFamily {
            help: escape_help(&sample.help),
            counter,
            series: Vec::new(),
        });

        if family.counter != counter {
            warn!(metric = %name, "Dropping sample whose kind conflicts with its family");
            continue;
        }

        let mut key_labels = sample.labels.clone();
        key_labels.sort();
        if !seen.insert((name.clone(), key_labels)) {
            warn!(metric = %name, labels = ?sample.labels, "Dropping duplicate series");
            continue;
        }

        let labels = sample
            .labels
            .into_iter()
            .map(|(k, v)| (k, escape_label_value(&v)))
            .collect();
        family.series.push((labels, sample.value.value()));
    }

    families
}

/// One scrape's samples, encoded through a per-request registry
#[derive(Debug)]
struct SampleFamilies(BTreeMap<String, SampleFamily>);

impl RegistryCollector for SampleFamilies {
    fn encode(&self, mut encoder: DescriptorEncoder) -> std::result::Result<(), std::fmt::Error> {
        for (name, family) in self.0.iter() {
            let metric_type = if family.counter {
                MetricType::Counter
            } else {
                MetricType::Gauge
            };
            let mut metric_encoder =
                encoder.encode_descriptor(name, &family.help, None, metric_type)?;

            for (labels, value) in &family.series {
                let series_encoder = metric_encoder.encode_family(labels)?;
                if family.counter {
                    ConstCounter::new(*value).encode(series_encoder)?;
                } else {
                    ConstGauge::new(*value).encode(series_encoder)?;
                }
            }
        }
        Ok(())
    }
}

/// Runs all registered collectors on each scrape
pub struct Exporter {
    scrape_buffer: usize,
    collectors: Vec<Arc<dyn Collector>>,
    metrics: ExporterMetrics,
    registry: Registry,
}

impl Exporter {
    pub fn new(namespace: &str, scrape_buffer: usize) -> Self {
        let metrics = ExporterMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry, namespace);

        Self {
            scrape_buffer: scrape_buffer.max(1),
            collectors: Vec::new(),
            metrics,
            registry,
        }
    }

    /// Registry for additional self-metrics, such as the health checker's
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    /// Counter to hand to strategy engines so per-source failures show up here
    pub fn source_error_counter(&self) -> SourceErrorCounter {
        self.metrics.source_errors.clone()
    }

    pub fn add_collector(&mut self, collector: Arc<dyn Collector>) {
        info!(collector = %collector.name(), "Registered collector");
        self.collectors.push(collector);
    }

    pub fn collector_names(&self) -> Vec<String> {
        self.collectors.iter().map(|c| c.name().to_string()).collect()
    }

    /// Run every collector concurrently and gather their samples
    ///
    /// Returns after every collector has finished. Cancelling `cancel` stops
    /// in-flight per-source work.
    #[instrument(skip_all, fields(scrape_id = %ScrapeId::new()))]
    pub async fn scrape(&self, cancel: CancellationToken) -> Vec<MetricSample> {
        let timer = MonotonicTimer::new();
        let (sink, mut rx) = MetricSink::channel(self.scrape_buffer);

        let mut workers = JoinSet::new();
        for collector in &self.collectors {
            let collector = collector.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let errors = self.metrics.collector_errors.clone();
            workers.spawn(async move {
                if let Err(e) = collector.collect(cancel, sink).await {
                    warn!(collector = %collector.name(), error = %e, "Collector failed");
                    errors
                        .get_or_create(&vec![("collector".to_string(), collector.name().to_string())])
                        .inc();
                }
            });
        }
        drop(sink);

        let drain = async {
            let mut samples = Vec::new();
            while let Some(sample) = rx.recv().await {
                samples.push(sample);
            }
            samples
        };
        let barrier = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Collector task panicked");
                }
            }
        };
        let (samples, ()) = tokio::join!(drain, barrier);

        let elapsed = timer.elapsed_secs();
        self.metrics.scrapes.inc();
        self.metrics.scrape_duration.observe(elapsed);
        self.metrics.scrape_samples.set(samples.len() as i64);
        debug!(samples = samples.len(), elapsed_secs = elapsed, "Scrape finished");

        samples
    }

    /// Scrape and render everything as OpenMetrics text
    ///
    /// Concurrent calls scrape independently; each encodes its own samples
    /// followed by the shared self-metrics.
    pub async fn render(&self, cancel: CancellationToken) -> Result<String> {
        let samples = self.scrape(cancel).await;

        let mut scraped = Registry::default();
        scraped.register_collector(Box::new(SampleFamilies(group_samples(samples))));

        let mut body = String::new();
        encode_body(&mut body, &scraped, &self.registry)
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(body)
    }
}

fn encode_body(
    body: &mut String,
    scraped: &Registry,
    own: &Registry,
) -> std::result::Result<(), std::fmt::Error> {
    encode_registry(body, scraped)?;
    encode_registry(body, own)?;
    encode_eof(body)
}
