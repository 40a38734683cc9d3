//! ABOUTME: Per-source label sets and the injector that stamps them onto samples
//! ABOUTME: Labels already present on a sample always win

use dx_pool::ConnectionPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::sample::MetricSample;

/// Label every sample carries to identify its source
pub const DATASOURCE_LABEL: &str = "datasource";

/// Labels for one source, always including `datasource`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    /// Build from a source name and its configured labels
    ///
    /// `datasource` defaults to the source name; a configured non-empty
    /// `datasource` label overrides it.
    pub fn new(source_name: &str, configured: BTreeMap<String, String>) -> Self {
        let mut labels = configured;
        let explicit = labels
            .get(DATASOURCE_LABEL)
            .is_some_and(|v| !v.trim().is_empty());
        if !explicit {
            labels.insert(DATASOURCE_LABEL.to_string(), source_name.to_string());
        }
        Self { labels }
    }

    /// Label set of a registered pool
    ///
    /// Label strings are validated with the configuration; if one slips
    /// through unparsed the source still gets its `datasource` label.
    pub fn for_pool(pool: &ConnectionPool) -> Self {
        let configured = pool.config().label_map().unwrap_or_else(|e| {
            warn!(datasource = %pool.name(), error = %e, "Ignoring unparsable labels");
            BTreeMap::new()
        });
        Self::new(pool.name(), configured)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Decorates samples with a source's labels
#[derive(Debug, Clone)]
pub struct LabelInjector {
    labels: LabelSet,
}

impl LabelInjector {
    pub fn new(labels: LabelSet) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Append every source label the sample does not already carry
    pub fn wrap(&self, mut sample: MetricSample) -> MetricSample {
        for (name, value) in self.labels.iter() {
            if !sample.has_label(name) {
                sample.labels.push((name.to_string(), value.to_string()));
            }
        }
        sample
    }
}

/// Injectors built once per pool name and reused across scrapes
#[derive(Debug, Default)]
pub struct InjectorCache {
    injectors: Mutex<HashMap<String, Arc<LabelInjector>>>,
}

impl InjectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pool: &ConnectionPool) -> Arc<LabelInjector> {
        let mut injectors = self.injectors.lock().unwrap_or_else(|p| p.into_inner());
        injectors
            .entry(pool.name().to_string())
            .or_insert_with(|| Arc::new(LabelInjector::new(LabelSet::for_pool(pool))))
            .clone()
    }
}
