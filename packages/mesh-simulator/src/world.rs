//! Node placement and embedded-node construction.
//!
//! Each simulated sensor is a complete `meshloc-node` context wired to the
//! in-memory hub instead of a UART, with a queue scanner fed by an RF
//! emitter model and a static GPS fix.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use meshloc_node::scanner::Scanner;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use meshloc_node::bus::MeshBus;
use meshloc_node::clock::MeshClock;
use meshloc_node::coordinator::{CoordinatorContext, Ctx};
use meshloc_node::geo;
use meshloc_node::pathloss::PathLossModel;
use meshloc_node::peer::run_mesh_loop;
use meshloc_node::results::ResultsBuffer;
use meshloc_node::scanner::{GpsFix, QueueScanner, ScanHit, StaticGps};
use meshloc_node::sdlog::NullLog;
use meshloc_node::session::{DebounceGate, Phase};
use meshloc_node::slots::ReportingSchedule;
use meshloc_types::{Mac, NodeId, RfEnvironment};

use crate::hub::SimHub;
use crate::rf;

#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub hdop: f32,
    pub has_gps: bool,
    /// When present, the node's clock disciplines itself from this fix.
    pub gps_datetime: Option<NaiveDateTime>,
}

pub struct SimNode {
    pub id: NodeId,
    pub ctx: Ctx,
    pub scanner: Arc<QueueScanner>,
    pub gps: Arc<StaticGps>,
    pub lat: f64,
    pub lon: f64,
}

/// Build one embedded node and start its mesh RX loop.
pub async fn spawn_node(hub: &SimHub, spec: &NodeSpec, env: RfEnvironment) -> SimNode {
    let id = NodeId::new(&spec.id).expect("sim node id");
    let (link, lines) = hub.attach(&spec.id);

    let scanner = Arc::new(QueueScanner::default());
    let gps = Arc::new(StaticGps::new(GpsFix {
        valid: spec.has_gps,
        lat: spec.lat,
        lon: spec.lon,
        hdop: spec.hdop,
        datetime: spec.gps_datetime,
        centiseconds: 0,
    }));

    let ctx: Ctx = Arc::new(CoordinatorContext {
        node_id: id.clone(),
        bus: Arc::new(MeshBus::new(Arc::new(link), Duration::from_millis(3000))),
        clock: Arc::new(MeshClock::new()),
        path_loss: Arc::new(RwLock::new(PathLossModel::from_environment(env))),
        scanner: scanner.clone(),
        gps: gps.clone(),
        results: Arc::new(ResultsBuffer::default()),
        event_log: Arc::new(NullLog),
        stop_requested: Arc::new(AtomicBool::new(false)),
        schedule: Arc::new(Mutex::new(ReportingSchedule::new())),
        debounce: DebounceGate::default(),
        session_tx: Mutex::new(None),
        phase: StdMutex::new(Phase::Idle),
        rf_env: StdMutex::new(env),
        total_hits: AtomicU32::new(0),
        boot: Instant::now(),
    });

    tokio::spawn(run_mesh_loop(ctx.clone(), lines));

    if let Some(datetime) = spec.gps_datetime {
        let _ = ctx.clock.feed_gps(datetime, 0).await;
    }

    SimNode { id, ctx, scanner, gps, lat: spec.lat, lon: spec.lon }
}

#[derive(Debug, Clone, Copy)]
pub struct Emitter {
    pub mac: Mac,
    pub lat: f64,
    pub lon: f64,
    pub wifi: bool,
    pub ble: bool,
}

/// Feed a node's scanner with synthetic hits from an emitter. Returns an
/// enable flag; clear it to silence the radio path (dead-peer scenarios).
pub fn spawn_emitter_feed(
    node: &SimNode,
    emitter: Emitter,
    env: RfEnvironment,
    sigma_db: f64,
    seed: u64,
) -> Arc<AtomicBool> {
    let enabled = Arc::new(AtomicBool::new(true));
    let flag = enabled.clone();
    let scanner = node.scanner.clone();
    let distance = geo::haversine_m(node.lat, node.lon, emitter.lat, emitter.lon);

    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        loop {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if !flag.load(Ordering::Relaxed) || !scanner.is_scanning() {
                continue;
            }
            for is_ble in [false, true] {
                let active = if is_ble { emitter.ble } else { emitter.wifi };
                if !active {
                    continue;
                }
                scanner.push(ScanHit {
                    mac: emitter.mac,
                    rssi: rf::rssi_at(distance, is_ble, env, sigma_db, &mut rng),
                    channel: if is_ble { 37 } else { 6 },
                    name: None,
                    is_ble,
                    identity: None,
                });
            }
        }
    });
    enabled
}
