//! ABOUTME: Scrape-time collection engine: strategies, adapters, label injection, exporter
//! ABOUTME: Turns healthy pools into one label-enriched metric stream per scrape

pub mod adapter;
pub mod collector;
pub mod context;
pub mod custom;
pub mod exporter;
pub mod health_exposer;
pub mod labels;
pub mod sample;
pub mod strategy;

pub use adapter::{CollectorFactory, MultiSourceCollector};
pub use collector::{Collector, SourceCollector};
pub use context::{CollectContext, MetricSink};
pub use custom::{CustomMetricsCollector, MetricDefinition, QueryCollector, ValueKind};
pub use exporter::{Exporter, ExporterMetrics};
pub use health_exposer::HealthExposer;
pub use labels::{InjectorCache, LabelInjector, LabelSet};
pub use sample::{MetricDesc, MetricSample, MetricValue};
pub use strategy::{CollectionStrategy, ExecutionSummary, PoolTask, StrategyEngine};
