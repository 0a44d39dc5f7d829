//! convoqueue server.
//!
//! Wires storage, scheduler and downstream handler into a `MessageBuffer` and
//! `RecoveryMonitor`, then mounts the queue routes.

use crate::config::{ConvoQueueConfig, SchedulerMode, StorageBackend};
use crate::downstream::HttpFlushHandler;
use crate::follow_up::WebhookScheduler;
use crate::http_auth;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use cq_core::{
    Clock, ConversationKey, DebounceScheduler, FlushHandler, LockManager, MemoryLockManager,
    MemoryQueueStore, MessageBuffer, QueueStore, RecoveryMonitor, SqliteStore, TimerScheduler,
    TokioClock,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct QueueState {
    pub buffer: Arc<MessageBuffer>,
    pub monitor: Arc<RecoveryMonitor>,
}

/// Everything `serve` owns: shared route state plus the background loops' handles.
pub struct QueueRuntime {
    pub state: Arc<QueueState>,
    timer: Option<Arc<TimerScheduler>>,
    due_keys: Option<mpsc::UnboundedReceiver<ConversationKey>>,
}

impl QueueRuntime {
    pub async fn start(&mut self) {
        if let Some(due_keys) = self.due_keys.take() {
            self.state.buffer.start(due_keys).await;
        }
        self.state.monitor.start().await;
    }

    pub async fn shutdown(&self) {
        self.state.monitor.shutdown().await;
        self.state.buffer.shutdown().await;
        if let Some(timer) = &self.timer {
            let armed = timer.armed();
            timer.shutdown();
            tracing::info!(armed_timers = armed, "debounce timers stopped");
        }
    }
}

pub async fn build_runtime(
    cfg: &ConvoQueueConfig,
    handler: Arc<dyn FlushHandler>,
) -> Result<QueueRuntime> {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let buffer_cfg = cfg.buffer_config();
    let (store, locks) = open_storage(cfg, buffer_cfg.entry_ttl, Arc::clone(&clock)).await?;

    let mut timer = None;
    let mut due_keys = None;
    let scheduler: Arc<dyn DebounceScheduler> = match cfg.scheduler.mode {
        SchedulerMode::Timer => {
            let (scheduler, rx) = TimerScheduler::new();
            let scheduler = Arc::new(scheduler);
            timer = Some(Arc::clone(&scheduler));
            due_keys = Some(rx);
            scheduler
        }
        SchedulerMode::Webhook => {
            let url = cfg
                .scheduler
                .follow_up_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("scheduler.follow_up_url is required"))?;
            Arc::new(
                WebhookScheduler::new(
                    url,
                    Duration::from_secs(cfg.scheduler.timeout_seconds),
                    Arc::clone(&clock),
                )?
                .with_auth_token(cfg.scheduler.auth_token.clone()),
            )
        }
    };

    let buffer = Arc::new(MessageBuffer::new(
        buffer_cfg,
        Arc::clone(&store),
        Arc::clone(&locks),
        handler,
        scheduler,
        Arc::clone(&clock),
    )?);
    let monitor = Arc::new(RecoveryMonitor::new(
        cfg.recovery_config(),
        store,
        locks,
        buffer.processor(),
        clock,
    )?);

    Ok(QueueRuntime {
        state: Arc::new(QueueState { buffer, monitor }),
        timer,
        due_keys,
    })
}

async fn open_storage(
    cfg: &ConvoQueueConfig,
    entry_ttl: Duration,
    clock: Arc<dyn Clock>,
) -> Result<(Arc<dyn QueueStore>, Arc<dyn LockManager>)> {
    match cfg.storage.backend {
        StorageBackend::Memory => {
            let store: Arc<dyn QueueStore> =
                Arc::new(MemoryQueueStore::new(entry_ttl, Arc::clone(&clock)));
            let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new(clock));
            tracing::info!(storage_backend = "memory", "queue storage opened");
            Ok((store, locks))
        }
        StorageBackend::Sqlite => {
            let path = cfg.sqlite_path()?;
            let sqlite = Arc::new(SqliteStore::open(&path, entry_ttl, clock).await?);
            tracing::info!(
                storage_backend = "sqlite",
                sqlite_path = %path.display(),
                "queue storage opened"
            );
            let store: Arc<dyn QueueStore> = sqlite.clone();
            let locks: Arc<dyn LockManager> = sqlite;
            Ok((store, locks))
        }
    }
}

fn build_handler(cfg: &ConvoQueueConfig) -> Result<Arc<dyn FlushHandler>> {
    let handler = HttpFlushHandler::new(
        &cfg.downstream.process_url,
        Duration::from_secs(cfg.downstream.timeout_seconds),
    )?
    .with_auth_token(cfg.downstream.auth_token.clone());
    tracing::info!(process_url = %handler.process_url(), "downstream handler configured");
    Ok(Arc::new(handler))
}

pub fn app_router(cfg: &ConvoQueueConfig, state: Arc<QueueState>) -> axum::Router {
    let auth_policy = http_auth::AdminAuthPolicy::from_config(cfg);
    routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_admin_auth))
        .layer(Extension(http_auth::AdminAuthPolicyExt(auth_policy)))
        .layer(Extension(state))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ConvoQueueConfig::load_with_path(config_path).await?;
    let buffer_cfg = cfg.buffer_config();
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let (store, locks) = open_storage(&cfg, buffer_cfg.entry_ttl, clock).await?;
    let indexed_keys = store.indexed_keys().await?.len();
    let held_locks = locks.list().await?.len();
    tracing::info!(
        config_path = %path.display(),
        storage_backend = store.backend(),
        scheduler_mode = ?cfg.scheduler.mode,
        process_url = %cfg.downstream.process_url,
        debounce_ms = buffer_cfg.debounce_window.as_millis() as u64,
        max_batch_size = buffer_cfg.max_batch_size,
        max_attempts = buffer_cfg.max_attempts,
        indexed_keys,
        held_locks,
        "config ok"
    );
    Ok(())
}

pub async fn sweep(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ConvoQueueConfig::load(config_path).await?;
    warn_if_process_local(&cfg, "sweep");
    let runtime = build_runtime(&cfg, build_handler(&cfg)?).await?;
    let report = runtime.state.monitor.sweep().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    runtime.shutdown().await;
    Ok(())
}

pub async fn health(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ConvoQueueConfig::load(config_path).await?;
    warn_if_process_local(&cfg, "health");
    let runtime = build_runtime(&cfg, build_handler(&cfg)?).await?;
    let snapshot = runtime.state.monitor.health().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    runtime.shutdown().await;
    Ok(())
}

fn warn_if_process_local(cfg: &ConvoQueueConfig, command: &str) {
    if cfg.storage.backend == StorageBackend::Memory {
        tracing::warn!(
            command,
            "storage.backend = \"memory\" holds no state outside a running server"
        );
    }
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = ConvoQueueConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    let buffer_cfg = cfg.buffer_config();
    let recovery_cfg = cfg.recovery_config();
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        storage_backend = ?cfg.storage.backend,
        scheduler_mode = ?cfg.scheduler.mode,
        admin_auth_configured = cfg.security.admin_token.is_some(),
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        debounce_ms = buffer_cfg.debounce_window.as_millis() as u64,
        max_batch_size = buffer_cfg.max_batch_size,
        max_batch_age_secs = buffer_cfg.max_batch_age.as_secs(),
        max_attempts = buffer_cfg.max_attempts,
        lock_ttl_secs = buffer_cfg.lock_ttl.as_secs(),
        reactivation_window_ms = buffer_cfg.reactivation_window.as_millis() as u64,
        sweep_interval_secs = recovery_cfg.sweep_interval.as_secs(),
        emergency_threshold_secs = recovery_cfg.emergency_threshold.as_secs(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let mut runtime = build_runtime(&cfg, build_handler(&cfg)?).await?;
    runtime.start().await;
    tracing::info!(
        scheduler = runtime.state.buffer.scheduler_name(),
        "buffer and recovery monitor started"
    );

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = app_router(&cfg, Arc::clone(&runtime.state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "convoqueue serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    runtime.shutdown().await;
    tracing::info!("queue runtime shutdown completed");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
