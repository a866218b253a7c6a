//! Weighted multi-triplet trilateration and the CEP68 uncertainty budget.
//!
//! Anchors are GPS-equipped node reports carrying an RSSI-derived range
//! estimate and a signal-quality weight. The solver projects the best five
//! anchors into a local ENU frame, solves the closed-form two-circle
//! difference system for every unordered triplet, and blends the solutions
//! weighted by the product of the triplet's qualities. Near-singular
//! triplets (collinear anchors) are skipped; if nothing survives, the fix is
//! degenerate.

use meshloc_types::NodeId;
use thiserror::Error;

use crate::geo;

const MAX_ANCHORS: usize = 5;
const DET_EPS: f64 = 1e-3;
const WEIGHT_EPS: f64 = 1e-3;
const HDOP_LIMIT: f32 = 15.0;
const HDOP_VALID_MAX: f32 = 50.0;
const NO_HDOP: f32 = 99.9;

/// CEP68 = 0.59 σ95 under a circular Gaussian error assumption.
const CEP68_FACTOR: f32 = 0.59;

/// Nominal GPS user-equivalent range error (meters). The coordinator's wire
/// T_F uses the tighter [`UERE_FUSED_M`].
pub const UERE_NOMINAL_M: f32 = 4.0;
pub const UERE_FUSED_M: f32 = 2.5;

// ── Inputs / outputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub node_id: NodeId,
    pub lat: f64,
    pub lon: f64,
    pub distance_m: f32,
    pub quality: f32,
    pub hdop: Option<f32>,
    pub is_ble: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
    pub confidence: f32,
    pub avg_hdop: f32,
    /// The anchors actually blended in, best-quality first. Feeds the
    /// uncertainty budget and the path-loss ground-truth loop.
    pub used: Vec<Anchor>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TrilaterationError {
    #[error("need at least 3 GPS anchors, have {0}")]
    TooFewAnchors(usize),
    #[error("mean HDOP {avg_hdop:.1} beyond usable limit")]
    PoorGps { avg_hdop: f32 },
    #[error("anchor geometry degenerate")]
    Degenerate,
}

/// Mean HDOP over anchors reporting a plausible value; 99.9 when none do.
pub fn avg_hdop(anchors: &[Anchor]) -> f32 {
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for a in anchors {
        if let Some(h) = a.hdop {
            if h > 0.0 && h < HDOP_VALID_MAX {
                sum += h;
                count += 1;
            }
        }
    }
    if count == 0 {
        NO_HDOP
    } else {
        sum / count as f32
    }
}

/// Coarse geometry-quality score from the minimum pairwise bearing spread
/// between anchors as seen from their centroid. Smaller is better.
pub fn gdop_estimate(anchors: &[Anchor]) -> f32 {
    if anchors.len() < 3 {
        return 999.9;
    }
    let lat0 = anchors.iter().map(|a| a.lat).sum::<f64>() / anchors.len() as f64;
    let lon0 = anchors.iter().map(|a| a.lon).sum::<f64>() / anchors.len() as f64;
    let enu: Vec<(f64, f64)> = anchors
        .iter()
        .map(|a| geo::to_enu(a.lat, a.lon, lat0, lon0))
        .collect();

    let mut min_angle = 180.0f64;
    for i in 0..enu.len() {
        for j in (i + 1)..enu.len() {
            let (x1, y1) = enu[i];
            let (x2, y2) = enu[j];
            let m1 = (x1 * x1 + y1 * y1).sqrt();
            let m2 = (x2 * x2 + y2 * y2).sqrt();
            if m1 > 0.0 && m2 > 0.0 {
                let cos = ((x1 * x2 + y1 * y2) / (m1 * m2)).clamp(-1.0, 1.0);
                min_angle = min_angle.min(cos.acos().to_degrees());
            }
        }
    }
    if min_angle < 20.0 {
        9.0
    } else if min_angle < 30.0 {
        5.0
    } else if min_angle < 45.0 {
        3.0
    } else {
        1.5
    }
}

// ── Solver ────────────────────────────────────────────────────────────────────

pub fn solve(anchors: &[Anchor]) -> Result<Fix, TrilaterationError> {
    if anchors.len() < 3 {
        return Err(TrilaterationError::TooFewAnchors(anchors.len()));
    }

    let mut sorted = anchors.to_vec();
    // Node-id tiebreak keeps selection and summation order deterministic
    // regardless of input order.
    sorted.sort_by(|a, b| {
        b.quality
            .total_cmp(&a.quality)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    sorted.truncate(MAX_ANCHORS);

    let avg_hdop = avg_hdop(&sorted);
    if avg_hdop > HDOP_LIMIT {
        return Err(TrilaterationError::PoorGps { avg_hdop });
    }

    let lat0 = sorted.iter().map(|a| a.lat).sum::<f64>() / sorted.len() as f64;
    let lon0 = sorted.iter().map(|a| a.lon).sum::<f64>() / sorted.len() as f64;

    let enu: Vec<(f64, f64)> = sorted
        .iter()
        .map(|a| geo::to_enu(a.lat, a.lon, lat0, lon0))
        .collect();

    let mut sum_e = 0.0f64;
    let mut sum_n = 0.0f64;
    let mut sum_w = 0.0f64;

    let n = sorted.len();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let (e1, n1) = enu[i];
                let (e2, n2) = enu[j];
                let (e3, n3) = enu[k];
                let r1 = sorted[i].distance_m as f64;
                let r2 = sorted[j].distance_m as f64;
                let r3 = sorted[k].distance_m as f64;

                // Subtracting pairs of range circles linearizes the system.
                let a = 2.0 * (e2 - e1);
                let b = 2.0 * (n2 - n1);
                let c = r1 * r1 - r2 * r2 - e1 * e1 + e2 * e2 - n1 * n1 + n2 * n2;
                let d = 2.0 * (e3 - e2);
                let e = 2.0 * (n3 - n2);
                let f = r2 * r2 - r3 * r3 - e2 * e2 + e3 * e3 - n2 * n2 + n3 * n3;

                let det = a * e - b * d;
                if det.abs() < DET_EPS {
                    continue;
                }
                let east = (c * e - f * b) / det;
                let north = (a * f - d * c) / det;

                let w = (sorted[i].quality * sorted[j].quality * sorted[k].quality) as f64;
                sum_e += east * w;
                sum_n += north * w;
                sum_w += w;
            }
        }
    }

    if sum_w < WEIGHT_EPS {
        return Err(TrilaterationError::Degenerate);
    }

    let (lat, lon) = geo::from_enu(sum_e / sum_w, sum_n / sum_w, lat0, lon0);

    let avg_quality = sorted.iter().map(|a| a.quality).sum::<f32>() / sorted.len() as f32;
    let confidence = (avg_quality
        * (1.0 - 0.1 * (avg_hdop - 1.0))
        * (1.0 - 0.05 * (sorted.len() as f32 - 3.0)))
        .clamp(0.0, 1.0);

    Ok(Fix { lat, lon, confidence, avg_hdop, used: sorted })
}

// ── Uncertainty budget ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct UncertaintyBudget {
    pub gps_err_m: f32,
    pub rssi_err_m: f32,
    pub geom_err_m: f32,
    pub sync_err_m: f32,
    pub calib_err_m: f32,
    pub sigma95_m: f32,
    pub cep68_m: f32,
}

/// Root-sum-square error budget over the anchors a fix actually used.
pub fn uncertainty(
    used: &[Anchor],
    mesh_synced: bool,
    path_loss_calibrated: bool,
    uere_m: f32,
) -> UncertaintyBudget {
    let n = used.len().max(1);
    let avg_d = used.iter().map(|a| a.distance_m).sum::<f32>() / n as f32;

    let gps_err = avg_hdop(used) * uere_m;

    let mut rssi_sq = 0.0f32;
    for a in used {
        let mut e = a.distance_m * (0.25 + 0.30 * (1.0 - a.quality));
        if a.is_ble {
            e *= 1.2;
        }
        rssi_sq += e * e;
    }
    let rssi_err = (rssi_sq / n as f32).sqrt();

    let geom_err = if used.len() == 3 {
        let lat0 = used.iter().map(|a| a.lat).sum::<f64>() / 3.0;
        let lon0 = used.iter().map(|a| a.lon).sum::<f64>() / 3.0;
        let p: Vec<(f64, f64)> = used
            .iter()
            .map(|a| geo::to_enu(a.lat, a.lon, lat0, lon0))
            .collect();
        let area_m2 = ((p[0].0 * (p[1].1 - p[2].1)
            + p[1].0 * (p[2].1 - p[0].1)
            + p[2].0 * (p[0].1 - p[1].1))
            / 2.0)
            .abs();
        if area_m2 < 100.0 {
            avg_d * 0.5
        } else if area_m2 < 500.0 {
            avg_d * 0.25
        } else if area_m2 < 1000.0 {
            avg_d * 0.15
        } else {
            avg_d * 0.05
        }
    } else {
        avg_d * 0.10 / ((used.len().saturating_sub(2)).max(1) as f32).sqrt()
    };

    let sync_err = if mesh_synced { 0.0 } else { avg_d * 0.10 };
    let calib_err = if path_loss_calibrated { 0.0 } else { avg_d * 0.15 };

    let sigma95 = (gps_err * gps_err
        + rssi_err * rssi_err
        + geom_err * geom_err
        + sync_err * sync_err
        + calib_err * calib_err)
        .sqrt();

    UncertaintyBudget {
        gps_err_m: gps_err,
        rssi_err_m: rssi_err,
        geom_err_m: geom_err,
        sync_err_m: sync_err,
        calib_err_m: calib_err,
        sigma95_m: sigma95,
        cep68_m: sigma95 * CEP68_FACTOR,
    }
}
