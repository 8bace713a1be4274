use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::Context as _;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use switchyard_reconciler::controllers::addon::{AddonReconciler, AddonReconcilerConfig};
use switchyard_reconciler::controllers::function::{FunctionReconciler, FunctionReconcilerConfig};
use switchyard_reconciler::controllers::{Controller, ControllerConfig};
use switchyard_reconciler::notifications::LogNotifier;
use switchyard_reconciler::orchestrator::{InMemoryOrchestrator, KubeOrchestrator, Orchestrator};
use switchyard_reconciler::repository::memory::InMemoryRepository;
use switchyard_reconciler::repository::Repository;
use switchyard_reconciler::telemetry::{self, LogFormat};
use switchyard_reconciler::State;

#[derive(Debug, clap::Parser)]
struct Arguments {
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Concurrent reconciliation workers
    #[arg(long, env = "RECONCILER_WORKERS", default_value_t = 5)]
    workers: usize,

    #[arg(long, env = "RECONCILER_QUEUE_CAPACITY", default_value_t = 100)]
    queue_capacity: usize,

    /// Seconds between sweeps for pending deployments
    #[arg(long, env = "RECONCILER_SCHEDULE_INTERVAL", default_value_t = 30)]
    schedule_interval: u64,

    /// Seconds between drift syncs against the cluster
    #[arg(long, env = "RECONCILER_DRIFT_SYNC_INTERVAL", default_value_t = 60)]
    drift_sync_interval: u64,

    /// Seconds between retry queue drains
    #[arg(long, env = "RECONCILER_RETRY_DRAIN_INTERVAL", default_value_t = 2)]
    retry_drain_interval: u64,

    /// Attempts before a deployment that keeps asking for retries is failed
    #[arg(long, env = "RECONCILER_MAX_ATTEMPTS", default_value_t = 10)]
    max_attempts: u32,

    #[arg(long, env = "ADDON_RECONCILE_INTERVAL", default_value_t = 30)]
    addon_interval: u64,

    #[arg(long, env = "FUNCTION_RECONCILE_INTERVAL", default_value_t = 30)]
    function_interval: u64,

    #[arg(long, env = "FUNCTION_BASE_DOMAIN", default_value = "fn.enclii.dev")]
    function_base_domain: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Keep platform state and cluster objects in memory instead of talking to a cluster
    #[arg(long, env = "IN_MEMORY")]
    in_memory: bool,
}

impl Arguments {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            schedule_interval: Duration::from_secs(self.schedule_interval),
            drift_sync_interval: Duration::from_secs(self.drift_sync_interval),
            retry_drain_interval: Duration::from_secs(self.retry_drain_interval),
            max_attempts: self.max_attempts,
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.health() {
        Ok(()) => HttpResponse::Ok().json("healthy"),
        Err(err) => HttpResponse::ServiceUnavailable().json(err.to_string()),
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[get("/status")]
async fn status(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.controller() {
        Some(controller) => HttpResponse::Ok().json(json!({
            "controller": controller.get_status(),
            "queue_pressure": controller.get_queue_pressure(),
        })),
        None => HttpResponse::ServiceUnavailable().json("controller not started"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format)?;

    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let orchestrator: Arc<dyn Orchestrator> = if args.in_memory {
        warn!("Running against in-memory cluster state");
        Arc::new(InMemoryOrchestrator::new())
    } else {
        Arc::new(
            KubeOrchestrator::try_default()
                .await
                .context("failed to create kubernetes client")?,
        )
    };

    let state = State::default();
    let reconcile_metrics = state.register_metrics()?;

    let controller = Arc::new(
        Controller::new(
            repo.clone(),
            orchestrator.clone(),
            Arc::new(LogNotifier),
            args.controller_config(),
        )
        .with_metrics(reconcile_metrics.clone())
        .with_diagnostics(state.diagnostics.clone()),
    );
    controller.start().await?;
    let state = state.with_controller(controller.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addons = AddonReconciler::new(
        repo.clone(),
        orchestrator.clone(),
        AddonReconcilerConfig {
            interval: Duration::from_secs(args.addon_interval),
        },
    )
    .with_metrics(reconcile_metrics.clone())
    .with_diagnostics(state.diagnostics.clone());
    let functions = FunctionReconciler::new(
        repo,
        orchestrator,
        FunctionReconcilerConfig {
            interval: Duration::from_secs(args.function_interval),
            base_domain: args.function_base_domain.clone(),
        },
    )
    .with_metrics(reconcile_metrics)
    .with_diagnostics(state.diagnostics.clone());

    let addon_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { addons.run(shutdown).await })
    };
    let function_task = tokio::spawn(async move { functions.run(shutdown_rx).await });

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(status)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();
    info!(address = %args.bind_address, "Serving status endpoints");

    // The server handles ctrl-c itself; the reconcilers stop once it returns
    let served = server.await;
    info!("Shutting down reconcilers");
    controller.stop().await;
    let _ = shutdown_tx.send(true);
    let (addon_result, function_result) = tokio::join!(addon_task, function_task);
    addon_result?;
    function_result?;
    served?;
    Ok(())
}
