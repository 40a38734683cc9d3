//! ABOUTME: HTTP surface for scrapes, liveness, readiness, and the source health report
//! ABOUTME: Serves the exporter's metrics and diagnostics over actix-web

use actix_web::{
    dev::{ServiceRequest, ServiceResponse},
    middleware::Logger,
    web, App, HttpResponse, HttpServer, Result as ActixResult,
};
use dx_collect::Exporter;
use dx_core::{Error, Result};
use dx_pool::PoolRegistry;
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Readiness gate flipped once the data sources are up
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    ready: Arc<AtomicBool>,
}

impl ReadinessGate {
    /// Starts not ready
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state for the HTTP handlers
#[derive(Clone)]
pub struct ObsState {
    pub readiness: ReadinessGate,
    pub exporter: Arc<Exporter>,
    pub registry: Arc<PoolRegistry>,
    pub metrics_path: String,
}

impl ObsState {
    pub fn new(exporter: Arc<Exporter>, registry: Arc<PoolRegistry>) -> Self {
        Self {
            readiness: ReadinessGate::new(),
            exporter,
            registry,
            metrics_path: "/metrics".to_string(),
        }
    }

    pub fn with_metrics_path(mut self, path: impl Into<String>) -> Self {
        self.metrics_path = path.into();
        self
    }
}

/// Liveness: the process is serving requests
async fn liveness() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok"
    })))
}

async fn readiness(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    let is_ready = state.readiness.is_ready() && state.registry.is_initialized();
    tracing::debug!(ready = is_ready, "Readiness check requested");

    if is_ready {
        Ok(HttpResponse::Ok().json(json!({
            "status": "ready"
        })))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(json!({
            "status": "not ready"
        })))
    }
}

/// Per-source health report
async fn health_report(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    match state.registry.health_report() {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => {
            tracing::warn!(error = %e, "Health report unavailable");
            Ok(HttpResponse::ServiceUnavailable().json(json!({
                "error": e.to_string()
            })))
        }
    }
}

async fn metrics(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    tracing::debug!("Metrics scrape requested");

    // Dropping this handler (client went away) cancels every in-flight source
    let cancel = CancellationToken::new();
    let _on_drop = cancel.clone().drop_guard();

    match state.exporter.render(cancel).await {
        Ok(body) => {
            tracing::debug!(bytes = body.len(), "Metrics encoded");
            Ok(HttpResponse::Ok()
                .content_type(OPENMETRICS_CONTENT_TYPE)
                .body(body))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to encode metrics"
            })))
        }
    }
}

/// Create the HTTP service factory
pub fn create_service(
    state: ObsState,
) -> App<
    impl actix_web::dev::ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let metrics_path = state.metrics_path.clone();
    App::new()
        .app_data(web::Data::new(state))
        .wrap(Logger::default())
        .service(
            web::scope("")
                .route("/healthz", web::get().to(liveness))
                .route("/readyz", web::get().to(readiness))
                .route("/health", web::get().to(health_report))
                .route(&metrics_path, web::get().to(metrics)),
        )
}

/// Serve until the server is stopped or fails
pub async fn start_server(bind_addr: &str, state: ObsState) -> Result<()> {
    tracing::info!(addr = %bind_addr, metrics_path = %state.metrics_path, "Starting HTTP server");

    HttpServer::new(move || create_service(state.clone()))
        .bind(bind_addr)
        .map_err(|e| Error::Config(format!("Failed to bind {}: {}", bind_addr, e)))?
        .run()
        .await?;

    Ok(())
}
