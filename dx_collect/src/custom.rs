//! ABOUTME: Custom metric definitions loaded from TOML and the collectors that run them
//! ABOUTME: Definitions are parsed once into typed form; per-source files are cached by name

use async_trait::async_trait;
use dx_config::LABEL_NAME_PATTERN;
use dx_core::{Error, Result};
use dx_pool::{ConnectionPool, DbHandle, PoolRegistry, QueryRow};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{MultiSourceCollector, PerSourceFactory};
use crate::collector::{Collector, SourceCollector};
use crate::context::{CollectContext, MetricSink};
use crate::labels::InjectorCache;
use crate::sample::{MetricDesc, MetricSample, MetricValue};
use crate::strategy::StrategyEngine;

/// Counter or gauge, decided when the definition is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueKind {
    Counter,
    #[default]
    Gauge,
}

impl ValueKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "counter" => Some(ValueKind::Counter),
            "gauge" => Some(ValueKind::Gauge),
            _ => None,
        }
    }

    pub fn value(self, v: f64) -> MetricValue {
        match self {
            ValueKind::Counter => MetricValue::Counter(v),
            ValueKind::Gauge => MetricValue::Gauge(v),
        }
    }
}

/// One value column of a definition
#[derive(Debug, Clone, PartialEq)]
pub struct ValueColumn {
    pub column: String,
    pub help: String,
    pub kind: ValueKind,
}

/// A query plus how to turn its rows into samples
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub context: String,
    pub request: String,
    pub labels: Vec<String>,
    pub values: Vec<ValueColumn>,
    pub ignore_zero_result: bool,
}

impl MetricDefinition {
    pub fn metric_name(&self, namespace: &str, column: &str) -> String {
        format!("{}_{}_{}", namespace, self.context, column).to_ascii_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    metric: Vec<RawMetric>,
}

#[derive(Debug, Deserialize)]
struct RawMetric {
    context: String,
    request: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    help: BTreeMap<String, String>,
    #[serde(default)]
    kind: BTreeMap<String, String>,
    #[serde(default)]
    ignore_zero_result: bool,
}

/// Parse a TOML document of `[[metric]]` tables
pub fn parse_definitions(raw: &str) -> Result<Vec<MetricDefinition>> {
    let file: RawFile = toml::from_str(raw)
        .map_err(|e| Error::Config(format!("invalid custom metrics file: {}", e)))?;
    let names = Regex::new(LABEL_NAME_PATTERN)
        .map_err(|e| Error::Config(format!("metric name pattern: {}", e)))?;

    file.metric
        .into_iter()
        .enumerate()
        .map(|(index, metric)| build_definition(index, metric, &names))
        .collect()
}

/// Read and parse a custom metrics file
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<MetricDefinition>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    parse_definitions(&raw)
}

fn build_definition(index: usize, raw: RawMetric, names: &Regex) -> Result<MetricDefinition> {
    let invalid = |reason: String| Error::Validation(format!("metric #{}: {}", index + 1, reason));

    if !names.is_match(&raw.context) {
        return Err(invalid(format!("invalid context '{}'", raw.context)));
    }
    if raw.request.trim().is_empty() {
        return Err(invalid("request is empty".to_string()));
    }
    if raw.help.is_empty() {
        return Err(invalid("no value columns in help".to_string()));
    }
    if let Some(label) = raw.labels.iter().find(|l| !names.is_match(l)) {
        return Err(invalid(format!("invalid label name '{}'", label)));
    }
    if let Some(column) = raw.kind.keys().find(|k| !raw.help.contains_key(*k)) {
        return Err(invalid(format!("kind given for unknown column '{}'", column)));
    }

    let mut values = Vec::with_capacity(raw.help.len());
    for (column, help) in raw.help {
        if !names.is_match(&column) {
            return Err(invalid(format!("invalid column name '{}'", column)));
        }
        let kind = match raw.kind.get(&column) {
            Some(k) => ValueKind::parse(k)
                .ok_or_else(|| invalid(format!("unknown kind '{}' for '{}'", k, column)))?,
            None => ValueKind::default(),
        };
        values.push(ValueColumn { column, help, kind });
    }

    Ok(MetricDefinition {
        context: raw.context,
        request: raw.request,
        labels: raw.labels,
        values,
        ignore_zero_result: raw.ignore_zero_result,
    })
}

/// Runs a list of definitions against one handle
pub struct QueryCollector {
    namespace: String,
    definitions: Arc<Vec<MetricDefinition>>,
    handle: DbHandle,
}

impl QueryCollector {
    pub fn new(
        namespace: impl Into<String>,
        definitions: Arc<Vec<MetricDefinition>>,
        handle: DbHandle,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            definitions,
            handle,
        }
    }

    async fn run_definition(
        &self,
        definition: &MetricDefinition,
        ctx: &CollectContext,
        sink: &MetricSink,
    ) -> Result<()> {
        let rows = ctx.run(self.handle.query(&definition.request)).await?;

        if rows.is_empty() {
            if definition.ignore_zero_result {
                return Ok(());
            }
            return Err(Error::Query(format!(
                "'{}' returned no rows",
                definition.context
            )));
        }

        for row in &rows {
            for sample in self.samples_from_row(definition, row) {
                sink.send(sample).await?;
            }
        }
        Ok(())
    }

    fn samples_from_row(&self, definition: &MetricDefinition, row: &QueryRow) -> Vec<MetricSample> {
        let labels: Vec<(String, String)> = definition
            .labels
            .iter()
            .map(|name| {
                let value = row.get(name).map(|v| v.as_label()).unwrap_or_default();
                (name.to_ascii_lowercase(), value)
            })
            .collect();

        definition
            .values
            .iter()
            .filter_map(|column| {
                let Some(value) = row.get(&column.column).and_then(|v| v.as_f64()) else {
                    debug!(
                        context = %definition.context,
                        column = %column.column,
                        "Skipping non-numeric value"
                    );
                    return None;
                };
                Some(MetricSample {
                    name: definition.metric_name(&self.namespace, &column.column),
                    help: column.help.clone(),
                    value: column.kind.value(value),
                    labels: labels.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceCollector for QueryCollector {
    fn describe(&self) -> Vec<MetricDesc> {
        self.definitions
            .iter()
            .flat_map(|definition| {
                definition.values.iter().map(|column| {
                    MetricDesc::new(
                        definition.metric_name(&self.namespace, &column.column),
                        column.help.clone(),
                    )
                    .with_labels(definition.labels.iter().cloned())
                })
            })
            .collect()
    }

    async fn collect(&self, ctx: &CollectContext, sink: &MetricSink) -> Result<()> {
        let mut failed = Vec::new();

        for definition in self.definitions.iter() {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled(format!("{}: scrape cancelled", ctx.datasource())));
            }
            if let Err(e) = self.run_definition(definition, ctx, sink).await {
                warn!(
                    datasource = %ctx.datasource(),
                    context = %definition.context,
                    error = %e,
                    "Custom metric query failed"
                );
                failed.push(definition.context.as_str());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Query(format!(
                "{} of {} metric queries failed: {}",
                failed.len(),
                self.definitions.len(),
                failed.join(", ")
            )))
        }
    }
}

/// Definitions parsed per source, kept once a parse succeeds
///
/// A source whose file is missing or invalid is retried on every scrape so
/// a fixed file is picked up; the failure is logged once until then.
#[derive(Debug, Default)]
struct DefinitionCache {
    entries: Mutex<HashMap<String, Option<Arc<Vec<MetricDefinition>>>>>,
    failing: Mutex<HashSet<String>>,
}

impl DefinitionCache {
    fn get(&self, pool: &ConnectionPool) -> Option<Arc<Vec<MetricDefinition>>> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = entries.get(pool.name()) {
            return cached.clone();
        }

        let Some(path) = pool.config().custom_metrics.as_deref() else {
            debug!(datasource = %pool.name(), "No custom metrics file configured");
            entries.insert(pool.name().to_string(), None);
            return None;
        };

        let mut failing = self.failing.lock().unwrap_or_else(|p| p.into_inner());
        match load_definitions(path) {
            Ok(definitions) => {
                info!(
                    datasource = %pool.name(),
                    path = %path,
                    metrics = definitions.len(),
                    "Loaded custom metrics"
                );
                failing.remove(pool.name());
                let definitions = Arc::new(definitions);
                entries.insert(pool.name().to_string(), Some(definitions.clone()));
                Some(definitions)
            }
            Err(e) => {
                if failing.insert(pool.name().to_string()) {
                    warn!(
                        datasource = %pool.name(),
                        path = %path,
                        error = %e,
                        "Custom metrics file unusable, skipping source until it loads"
                    );
                } else {
                    debug!(datasource = %pool.name(), error = %e, "Custom metrics file still unusable");
                }
                None
            }
        }
    }
}

/// Runs each source's own custom metrics file against that source
pub struct CustomMetricsCollector {
    inner: MultiSourceCollector,
}

impl CustomMetricsCollector {
    pub fn new(
        namespace: impl Into<String>,
        registry: Arc<PoolRegistry>,
        engine: StrategyEngine,
    ) -> Self {
        let namespace = namespace.into();
        let cache = Arc::new(DefinitionCache::default());

        let factory: PerSourceFactory = Arc::new(move |pool: &ConnectionPool| {
            let definitions = cache.get(pool)?;
            Some(Box::new(QueryCollector::new(namespace.clone(), definitions, pool.handle()))
                as Box<dyn SourceCollector>)
        });

        Self {
            inner: MultiSourceCollector::per_source("custom_metrics", registry, engine, factory),
        }
    }

    pub fn with_injectors(mut self, injectors: Arc<InjectorCache>) -> Self {
        self.inner = self.inner.with_injectors(injectors);
        self
    }
}

#[async_trait]
impl Collector for CustomMetricsCollector {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn describe(&self) -> Vec<MetricDesc> {
        self.inner.describe()
    }

    async fn collect(&self, cancel: CancellationToken, sink: MetricSink) -> Result<()> {
        self.inner.collect(cancel, sink).await
    }
}
