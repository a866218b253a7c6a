//! End-to-end mesh sessions over the in-memory hub: full coordinator and
//! peer state machines, wire protocol included. Paused tokio time drives
//! the multi-minute session timelines in milliseconds of real time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::time::Instant;

use meshloc_node::coordinator::{start_triangulation, SessionError};
use meshloc_node::geo;
use meshloc_node::session::Phase;
use meshloc_sim::hub::SimHub;
use meshloc_sim::scenarios::ScenarioConfig;
use meshloc_sim::world::{spawn_emitter_feed, spawn_node, SimNode};
use meshloc_types::wire::{parse_line, Message};
use meshloc_types::{Mac, TargetRef};

fn sim_datetime() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 14)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

fn target() -> TargetRef {
    TargetRef::Mac(Mac::parse("DE:AD:BE:EF:00:01").unwrap())
}

/// Record every line on the bus for post-run assertions.
fn record_traffic(hub: &SimHub) -> Arc<Mutex<Vec<String>>> {
    let mut rx = hub.monitor();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            sink.lock().unwrap().push(line);
        }
    });
    lines
}

struct Mesh {
    hub: SimHub,
    nodes: Vec<SimNode>,
    lines: Arc<Mutex<Vec<String>>>,
    cfg: ScenarioConfig,
}

/// Square mesh with a centered emitter; `datetime_for(i)` controls which
/// nodes have a disciplined clock.
async fn build_mesh(
    cfg: ScenarioConfig,
    datetime_for: impl Fn(usize) -> Option<NaiveDateTime>,
) -> Mesh {
    let hub = SimHub::new(Duration::from_millis(20));
    let lines = record_traffic(&hub);
    let env = cfg.environment();
    let emitter = cfg.emitter();

    let mut nodes = Vec::new();
    for (i, mut spec) in cfg.node_specs(None).into_iter().enumerate() {
        spec.gps_datetime = datetime_for(i);
        let node = spawn_node(&hub, &spec, env).await;
        spawn_emitter_feed(&node, emitter, env, cfg.sigma_db, 42 + i as u64);
        nodes.push(node);
    }
    Mesh { hub, nodes, lines, cfg }
}

async fn run_to_completion(mesh: &Mesh) {
    let ctx = &mesh.nodes[0].ctx;
    start_triangulation(ctx, target(), mesh.cfg.duration_s, mesh.cfg.environment())
        .await
        .expect("session should start");

    let entered = Instant::now() + Duration::from_secs(5);
    while ctx.phase() == Phase::Idle && Instant::now() < entered {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_ne!(ctx.phase(), Phase::Idle, "coordinator never left Idle");

    let deadline = Instant::now() + Duration::from_secs(240);
    while ctx.phase() != Phase::Idle && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(ctx.phase(), Phase::Idle, "session never reached Terminal");
}

fn final_fix(lines: &Arc<Mutex<Vec<String>>>) -> Option<(f64, f64, f32, f32)> {
    lines.lock().unwrap().iter().find_map(|line| {
        match parse_line(line).ok()?.body {
            Message::FinalFix { lat, lon, conf_pct, uncertainty_m, .. } => {
                Some((lat, lon, conf_pct, uncertainty_m))
            }
            _ => None,
        }
    })
}

fn count_matching(lines: &Arc<Mutex<Vec<String>>>, needle: &str) -> usize {
    lines.lock().unwrap().iter().filter(|l| l.contains(needle)).count()
}

fn default_cfg() -> ScenarioConfig {
    // 40 s of scanning: long enough that peers run TDMA slot cycles before
    // their local duration elapses.
    ScenarioConfig {
        sigma_db: 0.0,
        duration_s: 40,
        ..Default::default()
    }
}

// ── S1: three-node square, Wi-Fi target ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn square_mesh_fixes_centered_emitter() {
    let cfg = default_cfg();
    let mesh = build_mesh(cfg, |_| Some(sim_datetime())).await;
    run_to_completion(&mesh).await;

    let emitter = mesh.cfg.emitter();
    let (lat, lon, conf, unc) = final_fix(&mesh.lines).expect("no T_F on the bus");
    let err = geo::haversine_m(lat, lon, emitter.lat, emitter.lon);
    assert!(err < 10.0, "fix error {err:.1} m");
    assert!(conf >= 50.0, "confidence {conf:.1}%");
    assert!(unc > 0.0 && unc < 20.0, "uncertainty {unc:.1} m");

    let results = mesh.nodes[0].ctx.results.get().await;
    assert!(results.contains("ESTIMATED POSITION"), "{results}");
    assert!(count_matching(&mesh.lines, "T_C:") >= 1);
}

// ── S2: peer drop after ACK ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn peer_dying_after_ack_does_not_block_fusion() {
    let mut cfg = default_cfg();
    cfg.peers = 3; // N1..N4
    let mesh = build_mesh(cfg, |_| Some(sim_datetime())).await;

    // N4 goes dark right after the recruiting window: it has ACKed but
    // will never report.
    let hub = mesh.hub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        hub.set_drop_rule(Box::new(|from, _| from != "N4"));
    });

    run_to_completion(&mesh).await;

    let (lat, lon, _, _) = final_fix(&mesh.lines).expect("fusion should survive a dead peer");
    let emitter = mesh.cfg.emitter();
    assert!(geo::haversine_m(lat, lon, emitter.lat, emitter.lon) < 25.0);

    let results = mesh.nodes[0].ctx.results.get().await;
    assert!(results.contains("ESTIMATED POSITION"), "{results}");
    assert!(count_matching(&mesh.lines, "T_C:") >= 1);
}

// ── S3: late joiner ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn peer_with_lost_ack_joins_late_and_contributes() {
    let mut cfg = default_cfg();
    cfg.peers = 3; // N1..N4
    let mesh = build_mesh(cfg, |_| Some(sim_datetime())).await;

    // N4's ACK never arrives; its reports do.
    mesh.hub
        .set_drop_rule(Box::new(|from, line| !(from == "N4" && line.contains("TRI_START_ACK"))));

    run_to_completion(&mesh).await;

    assert!(final_fix(&mesh.lines).is_some());
    let results = mesh.nodes[0].ctx.results.get().await;
    assert!(
        results.contains("N4:"),
        "late joiner missing from node table: {results}"
    );
}

// ── S4: debounce ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn second_start_inside_debounce_window_is_a_no_op() {
    let mut cfg = default_cfg();
    cfg.duration_s = 8;
    let mesh = build_mesh(cfg, |_| Some(sim_datetime())).await;
    run_to_completion(&mesh).await;

    let results_before = mesh.nodes[0].ctx.results.get().await;
    let starts_before = count_matching(&mesh.lines, "TRIANGULATE_START");

    tokio::time::sleep(Duration::from_secs(5)).await;
    let other = TargetRef::Mac(Mac::parse("11:22:33:44:55:66").unwrap());
    let outcome =
        start_triangulation(&mesh.nodes[0].ctx, other, 30, mesh.cfg.environment()).await;
    assert!(matches!(outcome, Err(SessionError::Debounced(_))));

    // Give any stray traffic time to appear; none should.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(count_matching(&mesh.lines, "TRIANGULATE_START"), starts_before);
    assert_eq!(mesh.nodes[0].ctx.results.get().await, results_before);
    assert_eq!(mesh.nodes[0].ctx.phase(), Phase::Idle);
}

// ── S5: BLE + Wi-Fi from the same peer ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn dual_radio_peer_keeps_one_report_reflecting_latest_radio() {
    let mut cfg = default_cfg();
    cfg.emitter_ble = true;
    let mesh = build_mesh(cfg, |_| Some(sim_datetime())).await;
    run_to_completion(&mesh).await;

    let lines = mesh.lines.lock().unwrap();
    let n2_wifi = lines
        .iter()
        .any(|l| l.starts_with("N2: T_D:") && l.contains("Type:WiFi"));
    let n2_ble = lines
        .iter()
        .any(|l| l.starts_with("N2: T_D:") && l.contains("Type:BLE"));
    drop(lines);
    assert!(n2_wifi, "peer should emit its Wi-Fi aggregate");
    assert!(n2_ble, "peer should emit its BLE aggregate");

    // One node-table entry per peer, showing the radio of the last report
    // (peers send Wi-Fi then BLE on stop).
    let results = mesh.nodes[0].ctx.results.get().await;
    let n2_rows = results
        .lines()
        .filter(|l| l.starts_with("N2:"))
        .count();
    assert_eq!(n2_rows, 1, "{results}");
    assert!(
        results.lines().any(|l| l.starts_with("N2:") && l.contains("Type=BLE")),
        "{results}"
    );
    assert!(final_fix(&mesh.lines).is_some());
}

// ── S6: clocks not converged ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unsynced_mesh_still_publishes_fix_with_degraded_budget() {
    let cfg = default_cfg();
    // Peers have GPS position but no time source: epoch seconds disagree
    // and the sync quorum fails.
    let mesh = build_mesh(cfg, |i| (i == 0).then(sim_datetime)).await;
    run_to_completion(&mesh).await;

    assert!(!mesh.nodes[0].ctx.clock.is_mesh_synced(10).await);
    let results = mesh.nodes[0].ctx.results.get().await;
    assert!(results.contains("Sync Status: Degraded"), "{results}");
    assert!(
        final_fix(&mesh.lines).is_some(),
        "degraded sync must not suppress the fix"
    );
}
