use axum::{
    Json, Router,
    extract::{FromRequest, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use cadence_core::engine::EngineCounters;
use cadence_core::feedback::TaggerStatsSnapshot;
use cadence_core::persist::{FlushReport, WriterStatsSnapshot};
use cadence_core::profile::EntityProfile;
use cadence_core::registry::RegistryStats;
use cadence_core::{CadenceEngine, EngineConfig, Observation, Snapshot};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender, bounded};
use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Histogram, IntGauge, TextEncoder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// METRICS
// ============================================================================

pub static OBSERVED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("cadence_observations_total", "Observations accepted").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "cadence_dropped_total",
        "Observations dropped due to backpressure",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static SAVES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("cadence_saves_total", "Explicit saves completed").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static LIVE_INSTANCES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("cadence_live_instances", "Instances in the live table").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static APPLY_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "cadence_apply_duration_seconds",
        "Time to apply one observation",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "cadence-gate", about = "HTTP front end for the cadence engine")]
struct Args {
    /// JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: String,

    /// Overrides persistence.store_path
    #[arg(long)]
    store: Option<PathBuf>,

    /// Overrides persistence.backup_path
    #[arg(long)]
    backup: Option<PathBuf>,

    /// Engine command queue depth
    #[arg(long, default_value_t = 100_000)]
    queue: usize,
}

// ============================================================================
// ENGINE WORKER
// ============================================================================

#[derive(Serialize)]
struct StatusReport {
    counters: EngineCounters,
    registry: RegistryStats,
    tagger: TaggerStatsSnapshot,
    writer: Option<WriterStatsSnapshot>,
    revision: u64,
}

enum Command {
    Observe(Observation),
    Snapshot(oneshot::Sender<Arc<Snapshot>>),
    Profiles {
        query: String,
        reply: oneshot::Sender<Vec<EntityProfile>>,
    },
    Save(oneshot::Sender<Result<FlushReport, String>>),
    Status(oneshot::Sender<StatusReport>),
}

/// Owns the engine; every mutation happens on this thread.
struct EngineWorker {
    engine: CadenceEngine,
    rx: Receiver<Command>,
}

impl EngineWorker {
    fn spawn(engine: CadenceEngine, rx: Receiver<Command>) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("cadence-engine".into())
            .spawn(move || {
                let worker = EngineWorker { engine, rx };
                worker.run();
            })
    }

    fn run(mut self) {
        info!("Engine worker active.");

        while let Ok(cmd) = self.rx.recv() {
            match cmd {
                Command::Observe(obs) => {
                    let timer = APPLY_LATENCY.start_timer();
                    self.engine.apply(obs);
                    timer.observe_duration();
                    LIVE_INSTANCES.set(self.engine.registry().len() as i64);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.engine.snapshot());
                }
                Command::Profiles { query, reply } => {
                    let hits = self
                        .engine
                        .store()
                        .profiles()
                        .search(&query)
                        .into_iter()
                        .cloned()
                        .collect();
                    let _ = reply.send(hits);
                }
                Command::Save(reply) => {
                    let result = self.engine.save_now().map_err(|e| e.to_string());
                    if result.is_ok() {
                        SAVES_TOTAL.inc();
                    }
                    let _ = reply.send(result);
                }
                Command::Status(reply) => {
                    let _ = reply.send(StatusReport {
                        counters: self.engine.counters().clone(),
                        registry: self.engine.registry_stats(),
                        tagger: self.engine.tagger_stats().snapshot(),
                        writer: self.engine.writer_stats().map(|s| s.snapshot()),
                        revision: self.engine.store().revision(),
                    });
                }
            }
        }

        // Senders gone: flush and stop the writer.
        self.engine.shutdown();
        info!("Engine worker stopped.");
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Clone)]
struct AppState {
    tx: Sender<Command>,
}

struct SimdJson<T>(T);

impl<S, T> FromRequest<S> for SimdJson<T>
where
    T: for<'de> Deserialize<'de>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| e.into_response())?;
        let mut bytes_vec = bytes.to_vec();

        let val = simd_json::from_slice::<T>(&mut bytes_vec)
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON").into_response())?;

        Ok(SimdJson(val))
    }
}

impl AppState {
    fn offer(&self, obs: Observation) -> bool {
        match self.tx.try_send(Command::Observe(obs)) {
            Ok(_) => {
                OBSERVED_TOTAL.inc();
                true
            }
            Err(_) => {
                DROPPED_TOTAL.inc();
                false
            }
        }
    }

    /// Round-trip a request to the engine thread.
    async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, StatusCode> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(make(reply))
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
        rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn observe(State(state): State<AppState>, SimdJson(obs): SimdJson<Observation>) -> StatusCode {
    if state.offer(obs) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Serialize)]
struct BatchReceipt {
    accepted: usize,
    dropped: usize,
}

async fn observe_batch(
    State(state): State<AppState>,
    SimdJson(batch): SimdJson<Vec<Observation>>,
) -> (StatusCode, Json<BatchReceipt>) {
    let total = batch.len();
    let accepted = batch
        .into_iter()
        .map(|o| state.offer(o))
        .filter(|&ok| ok)
        .count();
    let status = if accepted == total {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(BatchReceipt {
            accepted,
            dropped: total - accepted,
        }),
    )
}

async fn snapshot(State(state): State<AppState>) -> Result<Json<Snapshot>, StatusCode> {
    let snap = state.ask(Command::Snapshot).await?;
    Ok(Json(snap.as_ref().clone()))
}

#[derive(Deserialize)]
struct ProfileQuery {
    #[serde(default)]
    q: String,
}

async fn profiles(
    State(state): State<AppState>,
    Query(query): Query<ProfileQuery>,
) -> Result<Json<Vec<EntityProfile>>, StatusCode> {
    let hits = state
        .ask(|reply| Command::Profiles {
            query: query.q,
            reply,
        })
        .await?;
    Ok(Json(hits))
}

async fn save(State(state): State<AppState>) -> Response {
    match state.ask(Command::Save).await {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "Save failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
        Err(status) => status.into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, StatusCode> {
    Ok(Json(state.ask(Command::Status).await?))
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// ============================================================================
// MAIN
// ============================================================================

fn load_config(args: &Args) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(store) = &args.store {
        config.persistence.store_path = Some(store.clone());
    }
    if let Some(backup) = &args.backup {
        config.persistence.backup_path = Some(backup.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    // Register metrics before the first request.
    let _ = &*OBSERVED_TOTAL;
    let _ = &*DROPPED_TOTAL;
    let _ = &*SAVES_TOTAL;
    let _ = &*LIVE_INSTANCES;
    let _ = &*APPLY_LATENCY;

    let engine = CadenceEngine::open(config)?;
    info!(
        profiles = engine.store().profiles().len(),
        "Loaded profile store"
    );

    let (tx, rx) = bounded::<Command>(args.queue.max(1));
    let worker = EngineWorker::spawn(engine, rx)?;

    let state = AppState { tx };
    let app = Router::new()
        .route("/observe", post(observe))
        .route("/observe/batch", post(observe_batch))
        .route("/snapshot", get(snapshot))
        .route("/profiles", get(profiles))
        .route("/save", post(save))
        .route("/status", get(status))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    let listener = TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "Cadence gate listening.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutting down...");
        })
        .await?;

    // The router (and with it the last sender) is gone once serve returns.
    if worker.join().is_err() {
        error!("Engine worker panicked");
    }
    info!("Profiles flushed. Goodbye.");
    Ok(())
}
