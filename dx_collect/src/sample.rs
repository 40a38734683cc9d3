//! ABOUTME: Metric samples flowing from collectors to the exporter
//! ABOUTME: Counter and gauge semantics are a tagged value, fixed when the sample is built

use prometheus_client::metrics::MetricType;

/// Sample value with its metric kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
}

impl MetricValue {
    pub fn value(self) -> f64 {
        match self {
            MetricValue::Counter(v) | MetricValue::Gauge(v) => v,
        }
    }

    pub fn metric_type(self) -> MetricType {
        match self {
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Gauge(_) => MetricType::Gauge,
        }
    }

    pub fn is_counter(self) -> bool {
        matches!(self, MetricValue::Counter(_))
    }
}

/// One observation: name, help, value and ordered labels
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub help: String,
    pub value: MetricValue,
    pub labels: Vec<(String, String)>,
}

impl MetricSample {
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: MetricValue::Gauge(value),
            labels: Vec::new(),
        }
    }

    pub fn counter(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: MetricValue::Counter(value),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((name.into(), value.into()));
        self
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|(k, _)| k == name)
    }
}

/// Static description of a metric a collector can produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
}

impl MetricDesc {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: Vec::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_names.extend(labels.into_iter().map(Into::into));
        self
    }
}
