//! Mesh RX dispatch and the peer (child-node) role.
//!
//! The serial RX task delivers line-atomic frames here. Session-independent
//! traffic (time sync, status, results queries) is answered directly;
//! everything session-scoped is forwarded over a bounded channel into the
//! active coordinator or peer task. A `TRIANGULATE_START` from another
//! initiator spawns the peer role: ACK once, scan, report in-slot, and flush
//! the final aggregates on stop. A peer never becomes an initiator.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshloc_types::wire::{parse_line, Frame, Message};
use meshloc_types::{NodeId, RfEnvironment, TargetRef};

use crate::coordinator::{emit_slot_report, Ctx};
use crate::results::NO_DATA;
use crate::scanner::{hit_matches, ScanMode, TargetAccumulator};
use crate::session::{build_target_data, Phase};

const POLL_TICK: Duration = Duration::from_millis(100);
const SCANNER_STOP_WAIT: Duration = Duration::from_secs(3);

// ── RX loop ───────────────────────────────────────────────────────────────────

/// Drain the mesh link into frames and dispatch them. Runs for the process
/// lifetime.
pub async fn run_mesh_loop(ctx: Ctx, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        // Receive timestamp is taken before parsing so propagation-delay
        // measurement excludes local processing.
        let rx_micros = ctx.clock.monotonic_us();
        let frame = match parse_line(&line) {
            Ok(f) => f,
            Err(e) => {
                debug!("mesh line rejected: {e}");
                continue;
            }
        };
        if frame.sender == ctx.node_id || !frame.addressed_to(&ctx.node_id) {
            continue;
        }
        dispatch(&ctx, frame, rx_micros).await;
    }
}

async fn dispatch(ctx: &Ctx, frame: Frame, rx_micros: i64) {
    match &frame.body {
        Message::TimeSyncReq { tx_micros_lo32, .. } => {
            let delay = ctx
                .clock
                .on_sync_request(&frame.sender, *tx_micros_lo32, rx_micros)
                .await;
            respond_time_sync(ctx, delay).await;
        }
        Message::TimeSyncResp { epoch_s, tx_micros_lo32, prop_delay_us, .. } => {
            if let Err(e) = ctx
                .clock
                .record_peer_sync(&frame.sender, *epoch_s, *tx_micros_lo32, *prop_delay_us)
                .await
            {
                debug!("peer sync skipped: {e}");
            }
        }
        Message::StatusQuery => send_status(ctx).await,
        Message::ResultsQuery => send_results_summary(ctx).await,
        Message::TriangulateStart { target, secs, initiator, env } => {
            if *initiator == ctx.node_id {
                return;
            }
            if ctx.session_active().await {
                debug!(from = %frame.sender, "TRIANGULATE_START ignored, session already active");
                return;
            }
            start_peer_session(ctx, *target, *secs, initiator.clone(), *env).await;
        }
        Message::TriangulateStop => {
            ctx.stop_requested.store(true, Ordering::SeqCst);
            forward(ctx, frame).await;
        }
        _ => forward(ctx, frame).await,
    }
}

/// Hand a session-scoped frame to the active session task, if any.
async fn forward(ctx: &Ctx, frame: Frame) {
    let slot = ctx.session_tx.lock().await;
    if let Some(tx) = slot.as_ref() {
        if tx.try_send(frame).is_err() {
            warn!("session event queue full, frame dropped");
        }
    }
}

// ── Session-independent replies ───────────────────────────────────────────────

async fn respond_time_sync(ctx: &Ctx, prop_delay_us: u32) {
    let Ok(epoch_us) = ctx.clock.epoch_micros().await else {
        return;
    };
    let body = Message::TimeSyncResp {
        epoch_s: (epoch_us / 1_000_000).max(0) as u64,
        subsec_cs: ((epoch_us % 1_000_000) / 10_000).unsigned_abs() as u16,
        tx_micros_lo32: ctx.clock.monotonic_us() as u32,
        prop_delay_us,
    };
    let _ = ctx
        .bus
        .send_frame(&Frame::new(ctx.node_id.clone(), body), false)
        .await;
}

async fn send_status(ctx: &Ctx) {
    let up = ctx.boot.elapsed().as_secs();
    let mut text = format!(
        "Mode:WiFi+BLE Scan:{} Hits:{} Up:{:02}:{:02}:{:02}",
        if ctx.scanner.is_scanning() { "ACTIVE" } else { "IDLE" },
        ctx.total_hits.load(Ordering::Relaxed),
        up / 3600,
        (up / 60) % 60,
        up % 60,
    );
    let gps = ctx.gps.poll();
    if gps.valid {
        text.push_str(&format!(" GPS:{:.6},{:.6} HDOP={:.1}", gps.lat, gps.lon, gps.hdop));
    }
    let _ = ctx
        .bus
        .send_frame(&Frame::new(ctx.node_id.clone(), Message::StatusReport(text)), false)
        .await;
}

/// Reply with the stored results summary between START/END markers, or
/// NO_DATA when nothing has been produced yet. Lines longer than the mesh
/// limit are truncated, not split.
async fn send_results_summary(ctx: &Ctx) {
    let text = ctx.results.get().await;
    if text == NO_DATA {
        let body = Message::Unknown("TRIANGULATE_RESULTS:NO_DATA".to_string());
        let _ = ctx
            .bus
            .send_frame(&Frame::new(ctx.node_id.clone(), body), true)
            .await;
        return;
    }

    let send = |body: Message| {
        let frame = Frame::new(ctx.node_id.clone(), body);
        async move { ctx.bus.send_frame(&frame, true).await }
    };
    let _ = send(Message::Unknown("TRIANGULATE_RESULTS_START".to_string())).await;
    for line in text.lines().filter(|l| !l.is_empty()).take(8) {
        let line: String = line.chars().take(120).collect();
        let _ = send(Message::Unknown(line)).await;
    }
    let _ = send(Message::Unknown("TRIANGULATE_RESULTS_END".to_string())).await;
}

// ── Peer role ─────────────────────────────────────────────────────────────────

async fn start_peer_session(
    ctx: &Ctx,
    target: TargetRef,
    secs: u32,
    coordinator: NodeId,
    env: RfEnvironment,
) {
    let mut slot = ctx.session_tx.lock().await;
    if slot.is_some() {
        return;
    }
    let (tx, rx) = mpsc::channel(64);
    *slot = Some(tx);
    drop(slot);

    info!(%target, secs, %coordinator, "joining session as peer");
    let ctx = ctx.clone();
    tokio::spawn(async move {
        run_peer_session(ctx, target, secs, coordinator, env, rx).await;
    });
}

async fn run_peer_session(
    ctx: Ctx,
    target: TargetRef,
    secs: u32,
    coordinator: NodeId,
    env: RfEnvironment,
    mut events: mpsc::Receiver<Frame>,
) {
    // Cancel whatever scan was running; the scanner owns radio state, so
    // wait for it to exit on its own rather than forcing it.
    if ctx.scanner.is_scanning() {
        ctx.scanner.stop();
        let waited = Instant::now();
        while ctx.scanner.is_scanning() && waited.elapsed() < SCANNER_STOP_WAIT {
            tokio::time::sleep(POLL_TICK).await;
        }
        if ctx.scanner.is_scanning() {
            warn!("previous scan task still running, proceeding anyway");
        }
    }

    ctx.path_loss.write().await.set_environment(env);
    *ctx.rf_env.lock().unwrap() = env;
    ctx.stop_requested.store(false, Ordering::SeqCst);
    ctx.set_phase(Phase::Scanning);

    let started = Instant::now();
    let mut accum = TargetAccumulator::default();

    // Exactly one ACK per session, before any T_D.
    let _ = ctx
        .bus
        .send_frame(&Frame::new(ctx.node_id.clone(), Message::TriStartAck), true)
        .await;

    ctx.scanner.start(ScanMode::Both, secs);

    let mut last_cycle_emitted: Option<u64> = None;
    let mut stop_from_mesh = false;

    loop {
        if ctx.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        if secs > 0 && started.elapsed() >= Duration::from_secs(secs as u64) {
            break;
        }

        while let Some(hit) = ctx.scanner.try_next_hit() {
            if hit_matches(&target, &hit) {
                let epoch = ctx.clock.epoch_micros().await.ok();
                accum.add(&hit, epoch);
                ctx.total_hits.fetch_add(1, Ordering::Relaxed);
            }
        }
        emit_slot_report(&ctx, target, &accum, &mut last_cycle_emitted).await;

        while let Ok(frame) = events.try_recv() {
            match frame.body {
                Message::TriCycleStart { start_ms, ref nodes } => {
                    // An empty node list leaves the schedule untouched.
                    if !nodes.is_empty() {
                        ctx.schedule.lock().await.rebuild(nodes, start_ms);
                        info!(start_ms, nodes = nodes.len(), "cycle schedule installed");
                    }
                }
                Message::TriangulateStop => {
                    stop_from_mesh = true;
                }
                _ => {}
            }
        }
        if stop_from_mesh {
            break;
        }
        tokio::time::sleep(POLL_TICK).await;
    }

    info!(
        %coordinator,
        wifi_hits = accum.wifi_hits,
        ble_hits = accum.ble_hits,
        "peer session stopping"
    );

    ctx.scanner.stop();
    let waited = Instant::now();
    while ctx.scanner.is_scanning() && waited.elapsed() < SCANNER_STOP_WAIT {
        tokio::time::sleep(POLL_TICK).await;
    }

    // Final aggregates: both radios when both observed, sequentially.
    let gps = ctx.gps.poll();
    let epoch = ctx.clock.epoch_micros().await.ok();
    for is_ble in [false, true] {
        if let Some(data) = build_target_data(target, &accum, is_ble, &gps, epoch) {
            let frame = Frame::new(ctx.node_id.clone(), Message::TargetData(data));
            let _ = ctx.bus.send_frame(&frame, true).await;
        }
    }
    let _ = ctx
        .bus
        .send_frame(
            &Frame::new(ctx.node_id.clone(), Message::TriangulateStopAck),
            false,
        )
        .await;

    *ctx.session_tx.lock().await = None;
    ctx.schedule.lock().await.reset();
    ctx.debounce.mark_terminal();
    ctx.set_phase(Phase::Idle);
    info!("peer session finished");
}
