//! Rolling diagnostic snapshot for the `/diag` endpoint.

use serde::Serialize;

use crate::clock::DisciplineStats;
use crate::coordinator::Ctx;
use crate::session::Phase;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSyncLine {
    pub node_id: String,
    pub offset_ms: i64,
    pub synced: bool,
    pub age_s: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioParamsLine {
    pub rssi0_dbm: f32,
    pub exponent_n: f32,
    pub calibrated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagSnapshot {
    pub node_id: String,
    pub uptime_s: u64,
    pub phase: Phase,
    pub scanning: bool,
    pub total_hits: u32,
    pub clock: Option<DisciplineStats>,
    pub mesh_synced: bool,
    pub peers: Vec<PeerSyncLine>,
    pub path_loss_wifi: RadioParamsLine,
    pub path_loss_ble: RadioParamsLine,
    pub gps_valid: bool,
}

pub async fn snapshot(ctx: &Ctx) -> DiagSnapshot {
    let path_loss = ctx.path_loss.read().await;
    let wifi = path_loss.params(false);
    let ble = path_loss.params(true);
    drop(path_loss);

    let peers = ctx
        .clock
        .sync_records()
        .await
        .into_iter()
        .map(|(id, rec)| PeerSyncLine {
            node_id: id.to_string(),
            offset_ms: rec.offset_us / 1000,
            synced: rec.synced,
            age_s: rec.last_check.elapsed().as_secs(),
        })
        .collect();

    DiagSnapshot {
        node_id: ctx.node_id.to_string(),
        uptime_s: ctx.boot.elapsed().as_secs(),
        phase: ctx.phase(),
        scanning: ctx.scanner.is_scanning(),
        total_hits: ctx.total_hits.load(std::sync::atomic::Ordering::Relaxed),
        clock: ctx.clock.discipline_stats().await.ok(),
        mesh_synced: ctx.clock.is_mesh_synced(10).await,
        peers,
        path_loss_wifi: RadioParamsLine {
            rssi0_dbm: wifi.rssi0,
            exponent_n: wifi.n,
            calibrated: wifi.calibrated,
        },
        path_loss_ble: RadioParamsLine {
            rssi0_dbm: ble.rssi0,
            exponent_n: ble.n,
            calibrated: ble.calibrated,
        },
        gps_valid: ctx.gps.poll().valid,
    }
}
