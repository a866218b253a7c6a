use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use meshloc_node::bus::{serial::SerialLink, MeshBus, MeshLink, NullLink};
use meshloc_node::config::{load_config, CONFIG_FILE};
use meshloc_node::coordinator::{send_time_sync_request, CoordinatorContext, Ctx};
use meshloc_node::clock::MeshClock;
use meshloc_node::http;
use meshloc_node::pathloss::PathLossModel;
use meshloc_node::peer::run_mesh_loop;
use meshloc_node::results::ResultsBuffer;
use meshloc_node::scanner::{GpsSource, QueueScanner, StaticGps};
use meshloc_node::sdlog::{EventLog, FileLog, NullLog};
use meshloc_node::session::{DebounceGate, Phase};
use meshloc_node::slots::ReportingSchedule;

/// Periodic housekeeping: GPS polling and clock discipline each tick, plus a
/// time-sync broadcast every 30 s while idle. Discipline is skipped during a
/// session so the epoch never jumps under an active slot schedule.
async fn run_housekeeping(ctx: Ctx) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_sync_broadcast = Instant::now();
    loop {
        interval.tick().await;
        let fix = ctx.gps.poll();
        if fix.valid && !ctx.session_active().await {
            if let Some(datetime) = fix.datetime {
                if let Err(e) = ctx.clock.feed_gps(datetime, fix.centiseconds).await {
                    warn!("clock discipline skipped: {e}");
                }
            }
        }
        if last_sync_broadcast.elapsed() >= Duration::from_secs(30) {
            send_time_sync_request(&ctx).await;
            last_sync_broadcast = Instant::now();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshloc_node=info".into()),
        )
        .init();

    let cfg = load_config(CONFIG_FILE).await;
    let node_id = cfg.node_id().context("configured nodeId is invalid")?;
    info!(
        "meshloc node {} v{} starting",
        node_id,
        env!("CARGO_PKG_VERSION")
    );

    // Mesh link: UART bridge when configured, otherwise a null link so the
    // node still serves its UI and scans standalone.
    let (link, lines): (Arc<dyn MeshLink>, mpsc::Receiver<String>) = match &cfg.serial_port {
        Some(port) => {
            let (link, rx) = SerialLink::open(port, cfg.serial_baud)
                .with_context(|| format!("opening mesh serial port {port}"))?;
            info!(port, baud = cfg.serial_baud, "mesh UART ready");
            (Arc::new(link), rx)
        }
        None => {
            warn!("no mesh serial port configured, running standalone");
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(tx);
            (Arc::new(NullLink), rx)
        }
    };

    let event_log: Arc<dyn EventLog> = match &cfg.sd_log_path {
        Some(path) => FileLog::spawn(path.clone()),
        None => Arc::new(NullLog),
    };

    // Radio drivers and the GPS receiver are external: they push into the
    // scanner queue / update the GPS source from their own tasks.
    let scanner = Arc::new(QueueScanner::default());
    let gps: Arc<dyn GpsSource> = Arc::new(StaticGps::default());

    let ctx: Ctx = Arc::new(CoordinatorContext {
        node_id,
        bus: Arc::new(MeshBus::new(
            link,
            Duration::from_millis(cfg.mesh_send_interval_ms),
        )),
        clock: Arc::new(MeshClock::new()),
        path_loss: Arc::new(RwLock::new(PathLossModel::from_environment(
            cfg.rf_environment,
        ))),
        scanner,
        gps,
        results: Arc::new(ResultsBuffer::default()),
        event_log,
        stop_requested: Arc::new(AtomicBool::new(false)),
        schedule: Arc::new(Mutex::new(ReportingSchedule::new())),
        debounce: DebounceGate::default(),
        session_tx: Mutex::new(None),
        phase: StdMutex::new(Phase::Idle),
        rf_env: StdMutex::new(cfg.rf_environment),
        total_hits: AtomicU32::new(0),
        boot: Instant::now(),
    });

    tokio::spawn(run_mesh_loop(ctx.clone(), lines));
    tokio::spawn(run_housekeeping(ctx.clone()));

    let app = http::router(ctx);
    let addr = format!("0.0.0.0:{}", cfg.http_port);
    info!("control surface listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
