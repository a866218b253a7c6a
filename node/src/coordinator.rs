//! Coordinator session state machine.
//!
//! One node per session assumes the coordinator role: it recruits peers,
//! synchronizes clocks, dispatches the TDMA cycle, aggregates T_D reports,
//! and fuses the result. The task is spawned per session and self-terminates
//! after the terminal transition; all waits are bounded sleeps with the
//! shared `stop_requested` flag polled at 100 ms granularity.
//!
//! Phase flow:
//!
//! ```text
//! Idle → Recruiting → CycleDispatch → Scanning → Stopping → Draining
//!      → Fusing → Publishing / PublishingPartial → Terminal → Idle
//! ```
//!
//! Recruiting aborts to Terminal when fewer than three participants
//! (coordinator included) answer. Late joiners — peers whose ACK was lost
//! but whose T_D arrives — are absorbed into the ACK table and the slot
//! schedule at any point; the drain window extends until three seconds after
//! the last discovery.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshloc_types::wire::{Frame, Message, TargetData};
use meshloc_types::{IdError, NodeId, RfEnvironment, TargetRef};

use crate::bus::MeshBus;
use crate::clock::MeshClock;
use crate::pathloss::PathLossModel;
use crate::results::{maps_url, render, ReportInput, ResultsBuffer};
use crate::scanner::{hit_matches, GpsSource, ScanMode, Scanner, TargetAccumulator};
use crate::sdlog::EventLog;
use crate::session::{
    build_target_data, DebounceGate, NodeReport, Phase, Role, SessionState,
};
use crate::slots::ReportingSchedule;
use crate::trilateration::{self, Fix};

const RECRUIT_WINDOW: Duration = Duration::from_secs(15);
const RECRUIT_SYNC_LEAD: Duration = Duration::from_secs(2);
const CYCLE_DISPATCH_PAUSE: Duration = Duration::from_secs(1);
const POLL_TICK: Duration = Duration::from_millis(100);
const STOP_INITIAL_WAIT: Duration = Duration::from_secs(10);
const DRAIN_BASE_MS: u64 = 8000;
const DRAIN_PER_NODE_MS: u64 = 2000;
const DRAIN_QUIET: Duration = Duration::from_secs(3);
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const SCANNER_STOP_WAIT: Duration = Duration::from_secs(3);
const MIN_PARTICIPANTS: usize = 3;
const MESH_SYNC_MAX_OFFSET_MS: u64 = 10;

// ── Shared context ────────────────────────────────────────────────────────────

/// Everything a session task needs, owned by the supervisor and shared by
/// reference. Components keep their own state; nothing here reaches beyond
/// its named collaborators.
pub struct CoordinatorContext {
    pub node_id: NodeId,
    pub bus: Arc<MeshBus>,
    pub clock: Arc<MeshClock>,
    pub path_loss: Arc<RwLock<PathLossModel>>,
    pub scanner: Arc<dyn Scanner>,
    pub gps: Arc<dyn GpsSource>,
    pub results: Arc<ResultsBuffer>,
    pub event_log: Arc<dyn EventLog>,
    /// Level-triggered universal abort, polled by every loop.
    pub stop_requested: Arc<AtomicBool>,
    /// Slot schedule; dedicated lock because peer scan loops read it too.
    pub schedule: Arc<Mutex<ReportingSchedule>>,
    pub debounce: DebounceGate,
    /// Route for mesh frames into the active session task, if any.
    pub session_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    pub phase: StdMutex<Phase>,
    pub rf_env: StdMutex<RfEnvironment>,
    /// Matching hits observed since boot, for STATUS replies.
    pub total_hits: AtomicU32,
    pub boot: Instant,
}

pub type Ctx = Arc<CoordinatorContext>;

impl CoordinatorContext {
    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub async fn session_active(&self) -> bool {
        self.session_tx.lock().await.is_some()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] IdError),
    #[error("session debounced, {0:?} remaining")]
    Debounced(Duration),
    #[error("a session is already active")]
    AlreadyActive,
}

// ── Session entry point ───────────────────────────────────────────────────────

/// Start a coordinator session. Rejects starts inside the debounce window
/// (no state is touched) and while another session is active.
pub async fn start_triangulation(
    ctx: &Ctx,
    target: TargetRef,
    secs: u32,
    env: RfEnvironment,
) -> Result<(), SessionError> {
    if let Err(remaining) = ctx.debounce.check() {
        info!(?remaining, "triangulation start debounced");
        return Err(SessionError::Debounced(remaining));
    }

    let mut slot = ctx.session_tx.lock().await;
    if slot.is_some() {
        return Err(SessionError::AlreadyActive);
    }
    let (tx, rx) = mpsc::channel(64);
    *slot = Some(tx);
    drop(slot);

    ctx.stop_requested.store(false, Ordering::SeqCst);
    *ctx.rf_env.lock().unwrap() = env;

    info!(%target, secs, ?env, "coordinator session starting");
    let ctx = ctx.clone();
    tokio::spawn(async move {
        run_coordinator(ctx, target, secs, env, rx).await;
    });
    Ok(())
}

// ── Mesh emission helpers ─────────────────────────────────────────────────────

async fn broadcast(ctx: &Ctx, body: Message, allow_wait: bool) {
    let frame = Frame::broadcast(ctx.node_id.clone(), body);
    if let Err(e) = ctx.bus.send_frame(&frame, allow_wait).await {
        warn!("mesh broadcast failed: {e}");
    }
}

pub async fn send_time_sync_request(ctx: &Ctx) {
    let epoch_us = match ctx.clock.epoch_micros().await {
        Ok(us) => us,
        Err(e) => {
            warn!("time sync request skipped: {e}");
            return;
        }
    };
    let body = Message::TimeSyncReq {
        epoch_s: (epoch_us / 1_000_000).max(0) as u64,
        subsec_cs: ((epoch_us % 1_000_000) / 10_000).unsigned_abs() as u16,
        tx_micros_lo32: ctx.clock.monotonic_us() as u32,
    };
    broadcast(ctx, body, false).await;
}

pub(crate) async fn emit_slot_report(
    ctx: &Ctx,
    target: TargetRef,
    accum: &TargetAccumulator,
    last_cycle: &mut Option<u64>,
) {
    let Ok(epoch_us) = ctx.clock.epoch_micros().await else {
        return;
    };
    let now_ms = (epoch_us / 1000).max(0) as u64;
    {
        let schedule = ctx.schedule.lock().await;
        if !schedule.is_slot_active(&ctx.node_id, now_ms) {
            return;
        }
        let cycle = schedule.cycle_number(now_ms);
        if cycle.is_none() || cycle == *last_cycle {
            return;
        }
        *last_cycle = cycle;
    }

    let gps = ctx.gps.poll();
    let preferred_ble = accum.wifi_hits == 0;
    if let Some(data) = build_target_data(target, accum, preferred_ble, &gps, Some(epoch_us)) {
        let frame = Frame::new(ctx.node_id.clone(), Message::TargetData(data));
        let _ = ctx.bus.send_frame(&frame, false).await;
    }
}

// ── Frame handling during a session ───────────────────────────────────────────

/// Apply one mesh frame to the session. Returns true when a previously
/// unknown peer appeared (ACK or late-joining T_D).
async fn handle_session_frame(
    ctx: &Ctx,
    session: &mut SessionState,
    frame: Frame,
) -> bool {
    match frame.body {
        Message::TriStartAck => {
            let is_new = session.ack(&frame.sender);
            if is_new {
                ctx.schedule.lock().await.add_node(&frame.sender);
                info!(peer = %frame.sender, total = session.ack_table.len(), "peer acknowledged");
            }
            is_new
        }
        Message::TargetData(data) => {
            if data.target != session.target {
                debug!(peer = %frame.sender, "T_D for foreign target ignored");
                return false;
            }
            let mut is_new = false;
            if !session.ack_table.contains_key(&frame.sender) {
                session.ack(&frame.sender);
                ctx.schedule.lock().await.add_node(&frame.sender);
                info!(peer = %frame.sender, "late joiner accepted");
                is_new = true;
            }
            let path_loss = ctx.path_loss.read().await;
            let report = session
                .node_reports
                .entry(frame.sender.clone())
                .or_insert_with(|| NodeReport::new(frame.sender.clone()));
            report.apply(&data, &path_loss);
            drop(path_loss);
            debug!(
                peer = %frame.sender,
                hits = data.hits,
                rssi = data.rssi_dbm,
                ble = data.is_ble,
                "node report merged"
            );
            if session.waiting_for_final_reports {
                session.mark_reported(&frame.sender);
            }
            is_new
        }
        Message::TriangulateStop => {
            info!("stop received from mesh, escalating");
            ctx.stop_requested.store(true, Ordering::SeqCst);
            false
        }
        Message::TriangulateStopAck => {
            debug!(peer = %frame.sender, "stop acknowledged");
            false
        }
        _ => false,
    }
}

// ── The state machine ─────────────────────────────────────────────────────────

async fn run_coordinator(
    ctx: Ctx,
    target: TargetRef,
    secs: u32,
    env: RfEnvironment,
    mut events: mpsc::Receiver<Frame>,
) {
    let mut session = SessionState::new(target, Role::Coordinator, env, secs);
    let mut accum = TargetAccumulator::default();

    ctx.clock.clear_peers().await;
    ctx.schedule.lock().await.reset();

    // ── Recruiting ────────────────────────────────────────────────────────
    session.phase = Phase::Recruiting;
    ctx.set_phase(Phase::Recruiting);
    send_time_sync_request(&ctx).await;

    let recruit_deadline = Instant::now() + RECRUIT_WINDOW;
    let mut start_broadcast_at = Some(Instant::now() + RECRUIT_SYNC_LEAD);
    while Instant::now() < recruit_deadline {
        if let Some(at) = start_broadcast_at {
            if Instant::now() >= at {
                broadcast(
                    &ctx,
                    Message::TriangulateStart {
                        target,
                        secs,
                        initiator: ctx.node_id.clone(),
                        env,
                    },
                    true,
                )
                .await;
                start_broadcast_at = None;
            }
        }
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(frame) => {
                    handle_session_frame(&ctx, &mut session, frame).await;
                }
                None => break,
            },
            _ = tokio::time::sleep(POLL_TICK) => {}
        }
    }

    let participants = 1 + session.ack_table.len();
    info!(
        acks = session.ack_table.len(),
        participants, "recruiting window closed"
    );

    if participants < MIN_PARTICIPANTS {
        session.phase = Phase::AbortedInsufficient;
        ctx.set_phase(Phase::AbortedInsufficient);
        warn!(participants, "aborting: not enough nodes for trilateration");
        ctx.results
            .set(format!(
                "TRIANGULATION FAILED: only {participants} node(s) responded. \
                 At least 3 are required.\n\
                 Ensure other nodes are powered on and in mesh range.\n"
            ))
            .await;
        if !session.ack_table.is_empty() {
            broadcast(&ctx, Message::TriangulateStop, false).await;
        }
        terminal(&ctx).await;
        return;
    }

    // ── Cycle dispatch ────────────────────────────────────────────────────
    session.phase = Phase::CycleDispatch;
    ctx.set_phase(Phase::CycleDispatch);
    tokio::time::sleep(CYCLE_DISPATCH_PAUSE).await;

    let cycle_start_ms = match ctx.clock.epoch_micros().await {
        Ok(us) => (us / 1000).max(0) as u64,
        Err(e) => {
            warn!("clock unavailable for cycle start, using monotonic: {e}");
            (ctx.clock.monotonic_us() / 1000) as u64
        }
    };
    let mut node_list: Vec<NodeId> = session.ack_table.keys().cloned().collect();
    node_list.push(ctx.node_id.clone());
    node_list.sort();

    ctx.schedule
        .lock()
        .await
        .rebuild(&node_list, cycle_start_ms);
    broadcast(
        &ctx,
        Message::TriCycleStart { start_ms: cycle_start_ms, nodes: node_list.clone() },
        true,
    )
    .await;
    info!(cycle_start_ms, nodes = node_list.len(), "cycle dispatched");

    ctx.scanner.start(ScanMode::Both, secs);

    // ── Scanning ──────────────────────────────────────────────────────────
    session.phase = Phase::Scanning;
    ctx.set_phase(Phase::Scanning);
    let scan_started = Instant::now();
    let mut last_cycle_emitted: Option<u64> = None;

    loop {
        if ctx.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        if secs > 0 && scan_started.elapsed() >= Duration::from_secs(secs as u64) {
            break;
        }

        while let Some(hit) = ctx.scanner.try_next_hit() {
            if hit_matches(&session.target, &hit) {
                let epoch = ctx.clock.epoch_micros().await.ok();
                accum.add(&hit, epoch);
                ctx.total_hits.fetch_add(1, Ordering::Relaxed);
            }
        }
        emit_slot_report(&ctx, session.target, &accum, &mut last_cycle_emitted).await;

        while let Ok(frame) = events.try_recv() {
            handle_session_frame(&ctx, &mut session, frame).await;
        }
        tokio::time::sleep(POLL_TICK).await;
    }

    // ── Stopping ──────────────────────────────────────────────────────────
    session.phase = Phase::Stopping;
    ctx.set_phase(Phase::Stopping);
    broadcast(&ctx, Message::TriangulateStop, false).await;
    session.stop_sent = Some(Instant::now());
    session.reset_report_flags();
    session.waiting_for_final_reports = true;
    // Refresh peer sync so the fusion-time quorum reflects current offsets.
    send_time_sync_request(&ctx).await;
    info!(
        acks = session.ack_table.len(),
        "stop broadcast, waiting for final reports"
    );

    let initial_deadline = Instant::now() + STOP_INITIAL_WAIT;
    while Instant::now() < initial_deadline {
        while let Ok(frame) = events.try_recv() {
            handle_session_frame(&ctx, &mut session, frame).await;
        }
        tokio::time::sleep(POLL_TICK).await;
    }

    // ── Draining ──────────────────────────────────────────────────────────
    session.phase = Phase::Draining;
    ctx.set_phase(Phase::Draining);
    let max_prop_ms = ctx.clock.max_prop_delay_ms().await;
    let timeout_ms =
        DRAIN_BASE_MS + DRAIN_PER_NODE_MS * session.ack_table.len() as u64 + 3 * max_prop_ms;
    info!(
        base_ms = DRAIN_BASE_MS,
        per_node_ms = DRAIN_PER_NODE_MS,
        max_prop_ms,
        timeout_ms,
        "adaptive drain timeout computed"
    );

    let drain_deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut last_new_node = Instant::now();
    while Instant::now() < drain_deadline {
        while let Ok(frame) = events.try_recv() {
            if handle_session_frame(&ctx, &mut session, frame).await {
                last_new_node = Instant::now();
            }
        }
        if session.all_reported() && last_new_node.elapsed() >= DRAIN_QUIET {
            info!(reported = session.reported_count(), "all peers reported");
            break;
        }
        tokio::time::sleep(POLL_TICK).await;
    }
    for node in session.unreported() {
        warn!(peer = %node, "peer never reported after stop");
    }

    // Grace period absorbs in-flight BLE-after-WiFi reports.
    let grace_deadline = Instant::now() + DRAIN_GRACE;
    while Instant::now() < grace_deadline {
        while let Ok(frame) = events.try_recv() {
            handle_session_frame(&ctx, &mut session, frame).await;
        }
        tokio::time::sleep(POLL_TICK).await;
    }

    // Scanner owns radio state; never force-kill it.
    ctx.scanner.stop();
    let stop_wait = Instant::now();
    while ctx.scanner.is_scanning() && stop_wait.elapsed() < SCANNER_STOP_WAIT {
        tokio::time::sleep(POLL_TICK).await;
    }
    if ctx.scanner.is_scanning() {
        warn!("scanner still running after stop deadline, proceeding without it");
    }

    // ── Fusing ────────────────────────────────────────────────────────────
    session.phase = Phase::Fusing;
    ctx.set_phase(Phase::Fusing);
    add_self_report(&ctx, &mut session, &accum).await;

    let anchors: Vec<_> = session
        .node_reports
        .values()
        .filter_map(|r| r.as_anchor())
        .collect();
    let mesh_synced = ctx.clock.is_mesh_synced(MESH_SYNC_MAX_OFFSET_MS).await;
    let path_loss_calibrated = ctx.path_loss.read().await.calibrated();

    let fix: Option<Fix> = if anchors.len() >= MIN_PARTICIPANTS {
        match trilateration::solve(&anchors) {
            Ok(fix) => {
                info!(
                    lat = fix.lat,
                    lon = fix.lon,
                    confidence = fix.confidence,
                    "trilateration succeeded"
                );
                feed_path_loss(&ctx, &session, &fix).await;
                Some(fix)
            }
            Err(e) => {
                warn!(
                    gdop = trilateration::gdop_estimate(&anchors),
                    "trilateration failed: {e}"
                );
                None
            }
        }
    } else {
        info!(gps_nodes = anchors.len(), "insufficient GPS nodes for trilateration");
        None
    };

    let budget_report = fix.as_ref().map(|f| {
        trilateration::uncertainty(
            &f.used,
            mesh_synced,
            path_loss_calibrated,
            trilateration::UERE_NOMINAL_M,
        )
    });
    let budget_fused = fix.as_ref().map(|f| {
        trilateration::uncertainty(
            &f.used,
            mesh_synced,
            path_loss_calibrated,
            trilateration::UERE_FUSED_M,
        )
    });

    if let (Some(f), Some(b)) = (&fix, &budget_fused) {
        let epoch_us = ctx.clock.epoch_micros().await.unwrap_or(0);
        session.final_result = Some(crate::session::FinalResult {
            lat: f.lat,
            lon: f.lon,
            confidence: f.confidence,
            uncertainty_m: b.cep68_m,
            epoch_us,
            coordinator: ctx.node_id.clone(),
        });
    }

    // ── Publishing ────────────────────────────────────────────────────────
    session.phase = if fix.is_some() { Phase::Publishing } else { Phase::PublishingPartial };
    ctx.set_phase(session.phase);
    ctx.bus.flush().await;

    publish(&ctx, &session, &anchors, &fix).await;

    let report_text = {
        let mut reports: Vec<&NodeReport> = session.node_reports.values().collect();
        reports.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        render(&ReportInput {
            target: session.target,
            duration_s: session.duration_s,
            elapsed_s: session.started.elapsed().as_secs(),
            reports,
            fix: fix.as_ref(),
            budget: budget_report.as_ref(),
            final_result: session.final_result.as_ref(),
            mesh_synced,
            path_loss_calibrated,
        })
    };
    ctx.results.set(report_text.clone()).await;
    ctx.event_log.append(&format!("TRIANGULATION_COMPLETE\n{report_text}---"));

    terminal(&ctx).await;
    info!("coordinator session finished");
}

/// Fold the coordinator's own scan accumulator in as a synthetic report.
async fn add_self_report(ctx: &Ctx, session: &mut SessionState, accum: &TargetAccumulator) {
    if accum.total_hits() == 0 || session.node_reports.contains_key(&ctx.node_id) {
        return;
    }
    let gps = ctx.gps.poll();
    let is_ble = accum.wifi_hits == 0;
    let epoch = ctx.clock.epoch_micros().await.ok();
    if let Some(data) = build_target_data(session.target, accum, is_ble, &gps, epoch) {
        let path_loss = ctx.path_loss.read().await;
        let mut report = NodeReport::new(ctx.node_id.clone());
        report.apply(&data, &path_loss);
        info!(
            hits = report.hits,
            rssi = report.rssi_dbm,
            ble = report.is_ble,
            "coordinator self-observation added"
        );
        session.node_reports.insert(ctx.node_id.clone(), report);
    }
}

/// Successful fixes become ground truth for the path-loss estimator: the
/// fix-to-anchor distance pairs with that anchor's filtered RSSI.
async fn feed_path_loss(ctx: &Ctx, session: &SessionState, fix: &Fix) {
    let mut path_loss = ctx.path_loss.write().await;
    for anchor in &fix.used {
        let d = crate::geo::haversine_m(anchor.lat, anchor.lon, fix.lat, fix.lon);
        if (0.5..50.0).contains(&d) {
            if let Some(report) = session.node_reports.get(&anchor.node_id) {
                path_loss.add_sample(report.filter.filtered(), d as f32, anchor.is_ble);
            }
        }
    }
}

/// Emit the coordinator's own T_D, the T_C aggregate, and — when the solve
/// succeeded — the final T_F fix.
async fn publish(
    ctx: &Ctx,
    session: &SessionState,
    anchors: &[trilateration::Anchor],
    fix: &Option<Fix>,
) {
    if let Some(self_report) = session.node_reports.get(&ctx.node_id) {
        if self_report.hits > 0 {
            let data = TargetData {
                target: session.target,
                hits: self_report.hits,
                rssi_dbm: self_report.rssi_dbm.round() as i8,
                is_ble: self_report.is_ble,
                lat_lon: self_report.has_gps.then_some((self_report.lat, self_report.lon)),
                hdop: self_report.hdop,
                detected_at_us: self_report.detected_at_us,
            };
            let frame = Frame::new(ctx.node_id.clone(), Message::TargetData(data));
            let _ = ctx.bus.send_frame(&frame, true).await;
        }
    }

    let aggregate = Message::CoordinatorAggregate {
        target: session.target,
        nodes: anchors.len() as u32,
        lat_lon: fix.as_ref().map(|f| (f.lat, f.lon)),
        conf_pct: fix.as_ref().map(|f| f.confidence * 100.0),
        url: fix.as_ref().map(|f| maps_url(f.lat, f.lon)),
    };
    let _ = ctx
        .bus
        .send_frame(&Frame::new(ctx.node_id.clone(), aggregate), true)
        .await;

    if let (Some(f), Some(final_result)) = (fix, &session.final_result) {
        let body = Message::FinalFix {
            target: session.target,
            lat: f.lat,
            lon: f.lon,
            conf_pct: f.confidence * 100.0,
            uncertainty_m: final_result.uncertainty_m,
        };
        let _ = ctx
            .bus
            .send_frame(&Frame::new(ctx.node_id.clone(), body), true)
            .await;
        info!("final fix published");
    }
}

/// Terminal transition: clear routing and schedule, record the stop time for
/// the debounce gate, return to Idle.
async fn terminal(ctx: &Ctx) {
    *ctx.session_tx.lock().await = None;
    ctx.schedule.lock().await.reset();
    ctx.debounce.mark_terminal();
    ctx.set_phase(Phase::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelLink;
    use crate::results::NO_DATA;
    use crate::scanner::{QueueScanner, StaticGps};
    use crate::sdlog::NullLog;
    use meshloc_types::Mac;

    fn test_ctx() -> (Ctx, mpsc::UnboundedReceiver<String>) {
        let (link, rx) = ChannelLink::pair();
        let ctx: Ctx = Arc::new(CoordinatorContext {
            node_id: NodeId::new("N1").unwrap(),
            bus: Arc::new(MeshBus::new(Arc::new(link), Duration::from_millis(3000))),
            clock: Arc::new(MeshClock::new()),
            path_loss: Arc::new(RwLock::new(PathLossModel::from_environment(
                RfEnvironment::Indoor,
            ))),
            scanner: Arc::new(QueueScanner::default()),
            gps: Arc::new(StaticGps::default()),
            results: Arc::new(ResultsBuffer::default()),
            event_log: Arc::new(NullLog),
            stop_requested: Arc::new(AtomicBool::new(false)),
            schedule: Arc::new(Mutex::new(ReportingSchedule::new())),
            debounce: DebounceGate::default(),
            session_tx: Mutex::new(None),
            phase: StdMutex::new(Phase::Idle),
            rf_env: StdMutex::new(RfEnvironment::Indoor),
            total_hits: AtomicU32::new(0),
            boot: Instant::now(),
        });
        (ctx, rx)
    }

    fn test_target() -> TargetRef {
        TargetRef::Mac(Mac([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]))
    }

    async fn wait_idle(ctx: &Ctx) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while ctx.phase() != Phase::Idle || ctx.session_active().await {
            assert!(Instant::now() < deadline, "session did not terminate");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lonely_coordinator_aborts_without_trilaterating() {
        let (ctx, mut rx) = test_ctx();
        start_triangulation(&ctx, test_target(), 30, RfEnvironment::Indoor)
            .await
            .unwrap();

        // A second start while the session is live is refused outright.
        assert!(matches!(
            start_triangulation(&ctx, test_target(), 30, RfEnvironment::Indoor).await,
            Err(SessionError::AlreadyActive)
        ));

        wait_idle(&ctx).await;

        let results = ctx.results.get().await;
        assert!(results.contains("TRIANGULATION FAILED"), "{results}");
        assert_ne!(results, NO_DATA);

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.contains("TIME_SYNC_REQ")));
        assert!(lines.iter().any(|l| l.contains("TRIANGULATE_START")));
        // No peers ACKed: the cycle never dispatches and nothing is fused.
        assert!(!lines.iter().any(|l| l.contains("TRI_CYCLE_START")));
        assert!(!lines.iter().any(|l| l.contains("T_F:")));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_inside_debounce_window_is_rejected() {
        let (ctx, _rx) = test_ctx();
        start_triangulation(&ctx, test_target(), 10, RfEnvironment::Indoor)
            .await
            .unwrap();
        wait_idle(&ctx).await;

        assert!(matches!(
            start_triangulation(&ctx, test_target(), 10, RfEnvironment::Indoor).await,
            Err(SessionError::Debounced(_))
        ));

        // Past the window a new session is accepted again.
        tokio::time::sleep(Duration::from_secs(21)).await;
        start_triangulation(&ctx, test_target(), 10, RfEnvironment::Indoor)
            .await
            .unwrap();
        wait_idle(&ctx).await;
    }
}
