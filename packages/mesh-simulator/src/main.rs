//! meshloc-sim — multi-node scenario runner.
//!
//! Spawns a mesh of complete embedded nodes over an in-memory serial hub,
//! plants an RF emitter, runs one full triangulation session from node N1,
//! and reports the fused fix against ground truth.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use meshloc_node::coordinator::start_triangulation;
use meshloc_node::geo;
use meshloc_node::session::Phase;
use meshloc_types::wire::{parse_line, Message};
use meshloc_types::TargetRef;

use meshloc_sim::hub::SimHub;
use meshloc_sim::scenarios::ScenarioConfig;
use meshloc_sim::world::{spawn_emitter_feed, spawn_node};

#[derive(Parser, Debug)]
#[command(name = "meshloc-sim", about = "meshloc mesh triangulation simulator")]
struct Args {
    /// Scenario config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Override: number of peers (coordinator excluded)
    #[arg(long)]
    peers: Option<usize>,
    /// Override: scan duration in seconds
    #[arg(long)]
    duration: Option<u32>,
    /// Override: RF environment preset (0..4)
    #[arg(long)]
    env: Option<u8>,
    /// Override: shadowing sigma in dB
    #[arg(long)]
    sigma: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshloc_sim=info,meshloc_node=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let mut cfg: ScenarioConfig = toml::from_str(&config_str).context("invalid config.toml")?;
    if let Some(p) = args.peers {
        cfg.peers = p;
    }
    if let Some(d) = args.duration {
        cfg.duration_s = d;
    }
    if let Some(e) = args.env {
        cfg.env = e;
    }
    if let Some(s) = args.sigma {
        cfg.sigma_db = s;
    }
    if cfg.peers < 2 {
        bail!("at least 2 peers are required for trilateration (3 participants)");
    }

    let env = cfg.environment();
    let emitter = cfg.emitter();
    info!(
        peers = cfg.peers,
        spacing_m = cfg.spacing_m,
        duration_s = cfg.duration_s,
        ?env,
        "scenario loaded"
    );

    let hub = SimHub::new(Duration::from_millis(20));
    let mut monitor = hub.monitor();

    let datetime = Some(chrono::Utc::now().naive_utc());
    let mut nodes = Vec::new();
    for spec in cfg.node_specs(datetime) {
        let node = spawn_node(&hub, &spec, env).await;
        spawn_emitter_feed(&node, emitter, env, cfg.sigma_db, 0xA5A5 + nodes.len() as u64);
        nodes.push(node);
    }
    let coordinator = &nodes[0];

    // Collect the wire traffic for the post-run summary.
    let (fix_tx, mut fix_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while let Some(line) = monitor.recv().await {
            if let Ok(frame) = parse_line(&line) {
                if let Message::FinalFix { lat, lon, conf_pct, uncertainty_m, .. } = frame.body {
                    let _ = fix_tx.send((lat, lon, conf_pct, uncertainty_m)).await;
                }
            }
        }
    });

    let target = TargetRef::Mac(cfg.target());
    start_triangulation(&coordinator.ctx, target, cfg.duration_s, env)
        .await
        .context("starting coordinator session")?;

    // Sessions run recruit (15 s) + scan + stop/drain; allow generous slack.
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(cfg.duration_s as u64 + 120);
    while coordinator.ctx.phase() == Phase::Idle && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    while coordinator.ctx.phase() != Phase::Idle && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!("{}", coordinator.ctx.results.get().await);

    if let Ok((lat, lon, conf, unc)) = fix_rx.try_recv() {
        let err = geo::haversine_m(lat, lon, emitter.lat, emitter.lon);
        println!(
            "Ground truth: {:.6},{:.6}  fused fix error: {err:.1} m \
             (confidence {conf:.1}%, CEP68 ±{unc:.1} m)",
            emitter.lat, emitter.lon
        );
    } else {
        println!("No T_F observed on the bus (session did not produce a fix).");
    }
    Ok(())
}
