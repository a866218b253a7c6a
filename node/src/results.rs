//! Shared human-readable results buffer and the session report renderer.
//!
//! The buffer always holds something readable: the last successful report,
//! the last explanatory failure, or the placeholder. Readers copy under
//! lock; there is no silent-error state.

use tokio::sync::RwLock;

use meshloc_types::TargetRef;

use crate::geo;
use crate::session::{FinalResult, NodeReport};
use crate::trilateration::{Fix, UncertaintyBudget};

pub const NO_DATA: &str = "No scan data yet.";

pub struct ResultsBuffer {
    text: RwLock<String>,
}

impl Default for ResultsBuffer {
    fn default() -> Self {
        Self { text: RwLock::new(NO_DATA.to_string()) }
    }
}

impl ResultsBuffer {
    pub async fn set(&self, text: String) {
        *self.text.write().await = text;
    }

    pub async fn get(&self) -> String {
        self.text.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.text.write().await = NO_DATA.to_string();
    }
}

pub fn maps_url(lat: f64, lon: f64) -> String {
    format!("https://www.google.com/maps?q={lat:.6},{lon:.6}")
}

// ── Report rendering ──────────────────────────────────────────────────────────

pub struct ReportInput<'a> {
    pub target: TargetRef,
    pub duration_s: u32,
    pub elapsed_s: u64,
    pub reports: Vec<&'a NodeReport>,
    pub fix: Option<&'a Fix>,
    pub budget: Option<&'a UncertaintyBudget>,
    pub final_result: Option<&'a FinalResult>,
    pub mesh_synced: bool,
    pub path_loss_calibrated: bool,
}

fn hdop_grade(hdop: f32) -> &'static str {
    if hdop < 2.0 {
        "EXCELLENT"
    } else if hdop < 5.0 {
        "GOOD"
    } else if hdop < 10.0 {
        "MODERATE"
    } else {
        "POOR"
    }
}

/// Render the full session report for the results buffer and the SD log.
pub fn render(input: &ReportInput<'_>) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("=== Triangulation Results ===\n");
    out.push_str(&format!("Target: {}\n", input.target));
    out.push_str(&format!("Duration: {}s\n", input.duration_s));
    out.push_str(&format!("Elapsed: {}s\n", input.elapsed_s));
    out.push_str(&format!("Reporting Nodes: {}\n", input.reports.len()));
    out.push_str(&format!(
        "Clock Sync: {}\n",
        if input.mesh_synced { "VERIFIED <10ms" } else { "WARNING >10ms" }
    ));

    if let Some(fr) = input.final_result {
        out.push_str("\n--- Coordinator Final Result ---\n");
        out.push_str(&format!("Coordinator Node: {}\n", fr.coordinator));
        out.push_str(&format!("  Latitude:  {:.6}\n", fr.lat));
        out.push_str(&format!("  Longitude: {:.6}\n", fr.lon));
        out.push_str(&format!("  Confidence: {:.1}%\n", fr.confidence * 100.0));
        out.push_str(&format!("  Uncertainty (CEP68): ±{:.1}m\n", fr.uncertainty_m));
        out.push_str(&format!("  Maps: {}\n", maps_url(fr.lat, fr.lon)));
    }

    if input.reports.is_empty() {
        out.push_str("\n--- No Mesh Nodes Responding ---\n");
        out.push_str("=== End Triangulation ===\n");
        return out;
    }

    out.push_str("\n--- Node Reports ---\n");
    let gps_reports: Vec<&&NodeReport> = input.reports.iter().filter(|r| r.has_gps).collect();
    for r in &input.reports {
        out.push_str(&format!(
            "{}: Filtered={:.1}dBm Hits={} Signal={:.1}% Type={}",
            r.node_id,
            r.filter.filtered(),
            r.hits,
            r.quality * 100.0,
            if r.is_ble { "BLE" } else { "WiFi" },
        ));
        if r.has_gps {
            out.push_str(&format!(
                " GPS={:.6},{:.6} Dist={:.1}m",
                r.lat, r.lon, r.distance_m
            ));
            if let Some(hdop) = r.hdop {
                out.push_str(&format!(" HDOP={hdop:.1}"));
            }
        } else {
            out.push_str(" GPS=NO");
        }
        out.push('\n');
    }

    if gps_reports.is_empty() {
        out.push_str("\n--- Triangulation Impossible ---\n");
        out.push_str(&format!(
            "{} node(s) reporting, but none have GPS.\n",
            input.reports.len()
        ));
        out.push_str("Triangulation requires GPS coordinates from nodes.\n");
        out.push_str("=== End Triangulation ===\n");
        return out;
    }

    if gps_reports.len() < 3 {
        out.push_str("\n--- Insufficient GPS Nodes ---\n");
        out.push_str(&format!("GPS nodes: {}/3 required\n", gps_reports.len()));
        out.push_str("Non-GPS nodes:\n");
        for r in &input.reports {
            if !r.has_gps {
                out.push_str(&format!("  - {} (enable GPS)\n", r.node_id));
            }
        }
    }

    // GPS vs RSSI cross-validation over anchor pairs.
    if gps_reports.len() >= 2 {
        out.push_str("\n--- GPS-RSSI Distance Validation ---\n");
        let mut total_error = 0.0f64;
        let mut count = 0u32;
        for i in 0..gps_reports.len() {
            for j in (i + 1)..gps_reports.len() {
                let (a, b) = (gps_reports[i], gps_reports[j]);
                let gps_dist = geo::haversine_m(a.lat, a.lon, b.lat, b.lon);
                let rssi_sum = (a.distance_m + b.distance_m) as f64;
                out.push_str(&format!(
                    "{} <-> {}: GPS={:.1}m RSSI={:.1}m/{:.1}m",
                    a.node_id, b.node_id, gps_dist, a.distance_m, b.distance_m
                ));
                if gps_dist > 0.0 && (rssi_sum < gps_dist * 0.5 || rssi_sum > gps_dist * 2.0) {
                    let err = (rssi_sum - gps_dist).abs() / gps_dist * 100.0;
                    total_error += err;
                    out.push_str(&format!(" MISMATCH (error: {err:.0}%)\n"));
                } else {
                    out.push_str(" OK\n");
                }
                count += 1;
            }
        }
        if count > 0 {
            let avg = total_error / count as f64;
            out.push_str(&format!("Avg error: {avg:.1}% "));
            if avg < 25.0 {
                out.push_str("(GOOD)\n");
            } else if avg < 50.0 {
                out.push_str("(FAIR - consider calibration)\n");
            } else {
                out.push_str("(POOR - calibration needed)\n");
                out.push_str("Run: POST /calibrate?target=<mac>&distance=<meters>\n");
            }
        }
    }

    if gps_reports.len() < 3 {
        out.push_str("\nNeed more GPS nodes for full triangulation.\n");
        out.push_str("=== End Triangulation ===\n");
        return out;
    }

    out.push_str("\n--- Weighted GPS Trilateration ---\n");
    match (input.fix, input.budget) {
        (Some(fix), budget) => {
            out.push_str(&format!("Using {} GPS-equipped nodes\n", fix.used.len()));
            out.push_str(&format!(
                "Average HDOP: {:.1} ({})\n",
                fix.avg_hdop,
                hdop_grade(fix.avg_hdop)
            ));
            out.push_str("ESTIMATED POSITION (RSSI):\n");
            out.push_str(&format!("  Latitude:  {:.6}\n", fix.lat));
            out.push_str(&format!("  Longitude: {:.6}\n", fix.lon));
            out.push_str(&format!("  Confidence: {:.1}%\n", fix.confidence * 100.0));
            out.push_str("  Method: Weighted trilateration + Kalman filtering\n");

            out.push_str("  Position validation:\n");
            for a in &fix.used {
                let gps_dist = geo::haversine_m(fix.lat, fix.lon, a.lat, a.lon);
                let err_pct = if a.distance_m > 0.0 {
                    ((gps_dist - a.distance_m as f64).abs() / a.distance_m as f64) * 100.0
                } else {
                    100.0
                };
                out.push_str(&format!(
                    "    {}: GPS={:.1}m RSSI={:.1}m {}\n",
                    a.node_id,
                    gps_dist,
                    a.distance_m,
                    if err_pct < 25.0 {
                        "OK".to_string()
                    } else {
                        format!("MISMATCH ({err_pct:.0}% error)")
                    }
                ));
            }

            if let Some(b) = budget {
                out.push_str(&format!("  Uncertainty (CEP68): ±{:.1}m\n", b.cep68_m));
                out.push_str(&format!("  Uncertainty (95%): ±{:.1}m\n", b.sigma95_m));
                out.push_str(&format!(
                    "  Error budget: GPS={:.1}m RSSI={:.1}m Geom={:.1}m\n",
                    b.gps_err_m, b.rssi_err_m, b.geom_err_m
                ));
            }
            out.push_str(&format!(
                "  Sync Status: {}\n",
                if input.mesh_synced { "Verified" } else { "Degraded" }
            ));
            out.push_str(&format!(
                "  Calibration: {}\n",
                if input.path_loss_calibrated { "Estimated" } else { "Preset" }
            ));
            out.push_str(&format!("  Maps: {}\n", maps_url(fix.lat, fix.lon)));
        }
        (None, _) => {
            out.push_str("TRILATERATION FAILED\n");
            out.push_str("Reason: poor geometry or signal quality\n");
            out.push_str("Suggestions:\n");
            out.push_str("  - Reposition nodes (120 degree separation ideal)\n");
            out.push_str("  - Allow more scan runtime\n");
        }
    }

    out.push_str("=== End Triangulation ===\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathloss::PathLossModel;
    use crate::session::NodeReport;
    use crate::trilateration;
    use meshloc_types::wire::TargetData;
    use meshloc_types::{Mac, NodeId, RfEnvironment};

    fn target() -> TargetRef {
        TargetRef::Mac(Mac([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]))
    }

    fn gps_report(id: &str, lat: f64, lon: f64) -> NodeReport {
        let pl = PathLossModel::from_environment(RfEnvironment::Indoor);
        let mut r = NodeReport::new(NodeId::new(id).unwrap());
        r.apply(
            &TargetData {
                target: target(),
                hits: 8,
                rssi_dbm: -62,
                is_ble: false,
                lat_lon: Some((lat, lon)),
                hdop: Some(1.0),
                detected_at_us: None,
            },
            &pl,
        );
        r
    }

    #[tokio::test]
    async fn buffer_defaults_and_round_trips() {
        let buf = ResultsBuffer::default();
        assert_eq!(buf.get().await, NO_DATA);
        buf.set("hello".into()).await;
        assert_eq!(buf.get().await, "hello");
        buf.clear().await;
        assert_eq!(buf.get().await, NO_DATA);
    }

    #[tokio::test]
    async fn empty_session_report() {
        let input = ReportInput {
            target: target(),
            duration_s: 30,
            elapsed_s: 31,
            reports: vec![],
            fix: None,
            budget: None,
            final_result: None,
            mesh_synced: false,
            path_loss_calibrated: false,
        };
        let text = render(&input);
        assert!(text.contains("No Mesh Nodes Responding"));
    }

    #[tokio::test]
    async fn no_gps_nodes_is_impossible() {
        let pl = PathLossModel::from_environment(RfEnvironment::Indoor);
        let mut r = NodeReport::new(NodeId::new("N2").unwrap());
        r.apply(
            &TargetData {
                target: target(),
                hits: 2,
                rssi_dbm: -70,
                is_ble: false,
                lat_lon: None,
                hdop: None,
                detected_at_us: None,
            },
            &pl,
        );
        let input = ReportInput {
            target: target(),
            duration_s: 30,
            elapsed_s: 30,
            reports: vec![&r],
            fix: None,
            budget: None,
            final_result: None,
            mesh_synced: true,
            path_loss_calibrated: false,
        };
        let text = render(&input);
        assert!(text.contains("Triangulation Impossible"));
        assert!(text.contains("GPS=NO"));
    }

    #[tokio::test]
    async fn full_report_carries_fix_and_budget() {
        let r1 = gps_report("N1", 0.0, 0.0);
        let r2 = gps_report("N2", 0.00045, 0.0);
        let r3 = gps_report("N3", 0.0, 0.00045);
        let anchors: Vec<_> = [&r1, &r2, &r3]
            .iter()
            .map(|r| r.as_anchor().unwrap())
            .collect();
        let fix = trilateration::solve(&anchors).unwrap();
        let budget =
            trilateration::uncertainty(&fix.used, true, false, trilateration::UERE_NOMINAL_M);
        let input = ReportInput {
            target: target(),
            duration_s: 60,
            elapsed_s: 61,
            reports: vec![&r1, &r2, &r3],
            fix: Some(&fix),
            budget: Some(&budget),
            final_result: None,
            mesh_synced: true,
            path_loss_calibrated: false,
        };
        let text = render(&input);
        assert!(text.contains("ESTIMATED POSITION"));
        assert!(text.contains("Error budget"));
        assert!(text.contains("google.com/maps"));
        assert!(text.contains("Distance Validation"));
    }
}
