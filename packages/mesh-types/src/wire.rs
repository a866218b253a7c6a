//! Line-oriented mesh wire protocol.
//!
//! Every mesh line is `[@<dest> ]<sender>: <body>` — printable ASCII,
//! newline-terminated, at most [`MAX_LINE_BYTES`] bytes. The targeting
//! prefix restricts processing to one node or `ALL`; lines without it are
//! processed by every listener. Unknown-but-well-formed bodies decode to
//! [`Message::Unknown`] so new message kinds never break old nodes.
//!
//! Field syntax inside bodies is whitespace-separated `key=value` /
//! `key:value`; optional fields may be absent. Coordinates are serialized
//! with 6 decimal digits, HDOP and confidence with 1.

use std::fmt;

use thiserror::Error;

use crate::{IdError, NodeId, RfEnvironment, TargetRef};

/// Hard ceiling imposed by the LoRa serial bridge.
pub const MAX_LINE_BYTES: usize = 200;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Targeting prefix: broadcast or a single addressee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dest {
    All,
    Node(NodeId),
}

/// One decoded mesh line.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub dest: Option<Dest>,
    pub sender: NodeId,
    pub body: Message,
}

impl Frame {
    pub fn new(sender: NodeId, body: Message) -> Self {
        Self { dest: None, sender, body }
    }

    pub fn broadcast(sender: NodeId, body: Message) -> Self {
        Self { dest: Some(Dest::All), sender, body }
    }

    /// True if this frame should be processed by `me`.
    pub fn addressed_to(&self, me: &NodeId) -> bool {
        match &self.dest {
            None | Some(Dest::All) => true,
            Some(Dest::Node(id)) => id == me,
        }
    }

    /// Render the frame as a wire line (no trailing newline).
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64);
        match &self.dest {
            Some(Dest::All) => out.push_str("@ALL "),
            Some(Dest::Node(id)) => {
                out.push('@');
                out.push_str(id.as_str());
                out.push(' ');
            }
            None => {}
        }
        out.push_str(self.sender.as_str());
        out.push_str(": ");
        out.push_str(&self.body.to_string());
        out
    }
}

// ── Message bodies ────────────────────────────────────────────────────────────

/// Per-peer detection report carried by a `T_D` line.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetData {
    pub target: TargetRef,
    pub hits: u32,
    /// Average filtered RSSI in dBm (signed 8-bit wire domain).
    pub rssi_dbm: i8,
    pub is_ble: bool,
    pub lat_lon: Option<(f64, f64)>,
    pub hdop: Option<f32>,
    /// Detection timestamp, epoch microseconds.
    pub detected_at_us: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Coordinator recruit broadcast.
    TriangulateStart {
        target: TargetRef,
        secs: u32,
        initiator: NodeId,
        env: RfEnvironment,
    },
    /// Peer participation acknowledgement.
    TriStartAck,
    /// Coordinator cycle start: coordinator-local monotonic ms + sorted node list.
    TriCycleStart { start_ms: u64, nodes: Vec<NodeId> },
    /// Per-peer data report.
    TargetData(TargetData),
    /// Coordinator aggregate summary.
    CoordinatorAggregate {
        target: TargetRef,
        nodes: u32,
        lat_lon: Option<(f64, f64)>,
        conf_pct: Option<f32>,
        url: Option<String>,
    },
    /// Coordinator final fused fix.
    FinalFix {
        target: TargetRef,
        lat: f64,
        lon: f64,
        conf_pct: f32,
        uncertainty_m: f32,
    },
    /// Session stop (priority on the bus).
    TriangulateStop,
    /// Peer stop acknowledgement (priority on the bus).
    TriangulateStopAck,
    TimeSyncReq {
        epoch_s: u64,
        subsec_cs: u16,
        tx_micros_lo32: u32,
    },
    TimeSyncResp {
        epoch_s: u64,
        subsec_cs: u16,
        tx_micros_lo32: u32,
        prop_delay_us: u32,
    },
    /// Node status query / reply.
    StatusQuery,
    StatusReport(String),
    /// Ask a node for its stored triangulation summary.
    ResultsQuery,
    /// Valid frame, unrecognized body. Kept verbatim.
    Unknown(String),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TriangulateStart { target, secs, initiator, env } => {
                write!(f, "TRIANGULATE_START:{target}:{secs}:{initiator}:{}", *env as u8)
            }
            Self::TriStartAck => f.write_str("TRI_START_ACK"),
            Self::TriCycleStart { start_ms, nodes } => {
                write!(f, "TRI_CYCLE_START:{start_ms}:")?;
                for (i, n) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    f.write_str(n.as_str())?;
                }
                Ok(())
            }
            Self::TargetData(d) => {
                write!(
                    f,
                    "T_D: {} Hits={} RSSI:{} Type:{}",
                    d.target,
                    d.hits,
                    d.rssi_dbm,
                    if d.is_ble { "BLE" } else { "WiFi" }
                )?;
                if let Some((lat, lon)) = d.lat_lon {
                    write!(f, " GPS={lat:.6},{lon:.6}")?;
                }
                if let Some(hdop) = d.hdop {
                    write!(f, " HDOP={hdop:.1}")?;
                }
                if let Some(us) = d.detected_at_us {
                    write!(f, " TS={}.{:06}", us / 1_000_000, (us % 1_000_000).abs())?;
                }
                Ok(())
            }
            Self::CoordinatorAggregate { target, nodes, lat_lon, conf_pct, url } => {
                write!(f, "T_C: MAC={target} Nodes={nodes}")?;
                if let Some((lat, lon)) = lat_lon {
                    write!(f, " GPS={lat:.6},{lon:.6}")?;
                }
                if let Some(conf) = conf_pct {
                    write!(f, " CONF={conf:.1}")?;
                }
                if let Some(url) = url {
                    write!(f, " URL={url}")?;
                }
                Ok(())
            }
            Self::FinalFix { target, lat, lon, conf_pct, uncertainty_m } => {
                write!(
                    f,
                    "T_F: MAC={target} GPS={lat:.6},{lon:.6} CONF={conf_pct:.1} UNC={uncertainty_m:.1}"
                )
            }
            Self::TriangulateStop => f.write_str("TRIANGULATE_STOP"),
            Self::TriangulateStopAck => f.write_str("TRIANGULATE_STOP_ACK"),
            Self::TimeSyncReq { epoch_s, subsec_cs, tx_micros_lo32 } => {
                write!(f, "TIME_SYNC_REQ:{epoch_s}:{subsec_cs}:{tx_micros_lo32}")
            }
            Self::TimeSyncResp { epoch_s, subsec_cs, tx_micros_lo32, prop_delay_us } => {
                write!(
                    f,
                    "TIME_SYNC_RESP:{epoch_s}:{subsec_cs}:{tx_micros_lo32}:{prop_delay_us}"
                )
            }
            Self::StatusQuery => f.write_str("STATUS"),
            Self::StatusReport(s) => write!(f, "STATUS: {s}"),
            Self::ResultsQuery => f.write_str("TRIANGULATE_RESULTS"),
            Self::Unknown(s) => f.write_str(s),
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line exceeds {MAX_LINE_BYTES} bytes ({0})")]
    TooLong(usize),
    #[error("empty line")]
    Empty,
    #[error("missing sender prefix")]
    MissingSender,
    #[error(transparent)]
    Id(#[from] IdError),
    #[error("malformed {0} field")]
    BadField(&'static str),
}

/// Decode one raw mesh line. The length check runs before any parsing;
/// non-printable characters are stripped on receipt.
pub fn parse_line(raw: &str) -> Result<Frame, ParseError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.len() > MAX_LINE_BYTES {
        return Err(ParseError::TooLong(raw.len()));
    }

    let clean: String = raw.chars().filter(|c| (' '..='~').contains(c)).collect();
    let mut rest = clean.trim();
    if rest.is_empty() {
        return Err(ParseError::Empty);
    }

    let dest = if let Some(tail) = rest.strip_prefix('@') {
        let (dst, after) = tail.split_once(' ').ok_or(ParseError::MissingSender)?;
        rest = after.trim_start();
        if dst == "ALL" {
            Some(Dest::All)
        } else {
            Some(Dest::Node(NodeId::new(dst)?))
        }
    } else {
        None
    };

    let (sender, body) = rest.split_once(": ").ok_or(ParseError::MissingSender)?;
    let sender = NodeId::new(sender)?;
    let body = parse_body(body.trim())?;

    Ok(Frame { dest, sender, body })
}

fn parse_body(body: &str) -> Result<Message, ParseError> {
    if let Some(rest) = body.strip_prefix("TRIANGULATE_START:") {
        // Target may itself contain colons (MAC), so peel fields off the tail.
        let mut it = rest.rsplitn(4, ':');
        let env = it.next().ok_or(ParseError::BadField("env"))?;
        let initiator = it.next().ok_or(ParseError::BadField("initiator"))?;
        let secs = it.next().ok_or(ParseError::BadField("secs"))?;
        let target = it.next().ok_or(ParseError::BadField("target"))?;
        return Ok(Message::TriangulateStart {
            target: TargetRef::parse(target)?,
            secs: secs.parse().map_err(|_| ParseError::BadField("secs"))?,
            initiator: NodeId::new(initiator)?,
            env: RfEnvironment::from_u8(
                env.parse().map_err(|_| ParseError::BadField("env"))?,
            ),
        });
    }
    if body == "TRI_START_ACK" {
        return Ok(Message::TriStartAck);
    }
    if let Some(rest) = body.strip_prefix("TRI_CYCLE_START:") {
        let (start_ms, csv) = rest.split_once(':').ok_or(ParseError::BadField("start_ms"))?;
        let start_ms = start_ms.parse().map_err(|_| ParseError::BadField("start_ms"))?;
        let mut nodes = Vec::new();
        for part in csv.split(',').filter(|p| !p.is_empty()) {
            nodes.push(NodeId::new(part)?);
        }
        return Ok(Message::TriCycleStart { start_ms, nodes });
    }
    if let Some(rest) = body.strip_prefix("T_D:") {
        return parse_target_data(rest.trim_start());
    }
    if let Some(rest) = body.strip_prefix("T_C:") {
        return parse_aggregate(rest.trim_start());
    }
    if let Some(rest) = body.strip_prefix("T_F:") {
        return parse_final_fix(rest.trim_start());
    }
    if body == "TRIANGULATE_STOP" {
        return Ok(Message::TriangulateStop);
    }
    if body == "TRIANGULATE_STOP_ACK" {
        return Ok(Message::TriangulateStopAck);
    }
    if let Some(rest) = body.strip_prefix("TIME_SYNC_REQ:") {
        let p: Vec<&str> = rest.split(':').collect();
        if p.len() != 3 {
            return Err(ParseError::BadField("time_sync_req"));
        }
        return Ok(Message::TimeSyncReq {
            epoch_s: p[0].parse().map_err(|_| ParseError::BadField("epoch_s"))?,
            subsec_cs: p[1].parse().map_err(|_| ParseError::BadField("subsec_cs"))?,
            tx_micros_lo32: p[2].parse().map_err(|_| ParseError::BadField("tx_micros"))?,
        });
    }
    if let Some(rest) = body.strip_prefix("TIME_SYNC_RESP:") {
        let p: Vec<&str> = rest.split(':').collect();
        if p.len() != 4 {
            return Err(ParseError::BadField("time_sync_resp"));
        }
        return Ok(Message::TimeSyncResp {
            epoch_s: p[0].parse().map_err(|_| ParseError::BadField("epoch_s"))?,
            subsec_cs: p[1].parse().map_err(|_| ParseError::BadField("subsec_cs"))?,
            tx_micros_lo32: p[2].parse().map_err(|_| ParseError::BadField("tx_micros"))?,
            prop_delay_us: p[3].parse().map_err(|_| ParseError::BadField("prop_delay"))?,
        });
    }
    if body == "STATUS" {
        return Ok(Message::StatusQuery);
    }
    if let Some(rest) = body.strip_prefix("STATUS: ") {
        return Ok(Message::StatusReport(rest.to_string()));
    }
    if body == "TRIANGULATE_RESULTS" {
        return Ok(Message::ResultsQuery);
    }
    Ok(Message::Unknown(body.to_string()))
}

/// Pull `key` out of a whitespace-tokenized body; `key` includes its
/// delimiter (`Hits=`, `RSSI:`).
fn field<'a>(tokens: &'a [&'a str], key: &str) -> Option<&'a str> {
    tokens.iter().find_map(|t| t.strip_prefix(key))
}

fn parse_lat_lon(s: &str) -> Result<(f64, f64), ParseError> {
    let (lat, lon) = s.split_once(',').ok_or(ParseError::BadField("gps"))?;
    Ok((
        lat.parse().map_err(|_| ParseError::BadField("lat"))?,
        lon.parse().map_err(|_| ParseError::BadField("lon"))?,
    ))
}

fn parse_target_data(rest: &str) -> Result<Message, ParseError> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let target = TargetRef::parse(tokens.first().ok_or(ParseError::BadField("target"))?)?;

    let hits = match field(&tokens, "Hits=") {
        Some(v) => v.parse().map_err(|_| ParseError::BadField("hits"))?,
        None => 1,
    };
    let rssi: i32 = field(&tokens, "RSSI:")
        .ok_or(ParseError::BadField("rssi"))?
        .parse()
        .map_err(|_| ParseError::BadField("rssi"))?;
    let is_ble = matches!(field(&tokens, "Type:"), Some("BLE"));
    let lat_lon = field(&tokens, "GPS=").map(parse_lat_lon).transpose()?;
    let hdop = field(&tokens, "HDOP=")
        .map(|v| v.parse().map_err(|_| ParseError::BadField("hdop")))
        .transpose()?;
    let detected_at_us = field(&tokens, "TS=")
        .map(|v| {
            v.parse::<f64>()
                .map(|sec| (sec * 1e6).round() as i64)
                .map_err(|_| ParseError::BadField("ts"))
        })
        .transpose()?;

    Ok(Message::TargetData(TargetData {
        target,
        hits,
        rssi_dbm: rssi.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
        is_ble,
        lat_lon,
        hdop,
        detected_at_us,
    }))
}

fn parse_aggregate(rest: &str) -> Result<Message, ParseError> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let target = TargetRef::parse(field(&tokens, "MAC=").ok_or(ParseError::BadField("mac"))?)?;
    let nodes = field(&tokens, "Nodes=")
        .ok_or(ParseError::BadField("nodes"))?
        .parse()
        .map_err(|_| ParseError::BadField("nodes"))?;
    let lat_lon = field(&tokens, "GPS=").map(parse_lat_lon).transpose()?;
    let conf_pct = field(&tokens, "CONF=")
        .map(|v| v.parse().map_err(|_| ParseError::BadField("conf")))
        .transpose()?;
    let url = field(&tokens, "URL=").map(str::to_string);
    Ok(Message::CoordinatorAggregate { target, nodes, lat_lon, conf_pct, url })
}

fn parse_final_fix(rest: &str) -> Result<Message, ParseError> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let target = TargetRef::parse(field(&tokens, "MAC=").ok_or(ParseError::BadField("mac"))?)?;
    let (lat, lon) = parse_lat_lon(field(&tokens, "GPS=").ok_or(ParseError::BadField("gps"))?)?;
    let conf_pct = field(&tokens, "CONF=")
        .ok_or(ParseError::BadField("conf"))?
        .parse()
        .map_err(|_| ParseError::BadField("conf"))?;
    let uncertainty_m = field(&tokens, "UNC=")
        .ok_or(ParseError::BadField("unc"))?
        .parse()
        .map_err(|_| ParseError::BadField("unc"))?;
    Ok(Message::FinalFix { target, lat, lon, conf_pct, uncertainty_m })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mac;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn t_d_round_trip_full() {
        let data = TargetData {
            target: TargetRef::Mac(Mac([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22])),
            hits: 14,
            rssi_dbm: -67,
            is_ble: true,
            lat_lon: Some((48.858093, 2.294694)),
            hdop: Some(1.2),
            detected_at_us: Some(1_700_000_000_123_456),
        };
        let frame = Frame::new(node("N1"), Message::TargetData(data.clone()));
        let line = frame.encode();
        assert!(line.len() <= MAX_LINE_BYTES);
        let back = parse_line(&line).unwrap();
        assert_eq!(back.sender, node("N1"));
        match back.body {
            Message::TargetData(d) => {
                assert_eq!(d.target, data.target);
                assert_eq!(d.hits, 14);
                assert_eq!(d.rssi_dbm, -67);
                assert!(d.is_ble);
                let (lat, lon) = d.lat_lon.unwrap();
                assert!((lat - 48.858093).abs() < 5e-7);
                assert!((lon - 2.294694).abs() < 5e-7);
                assert!((d.hdop.unwrap() - 1.2).abs() < 0.05);
                assert_eq!(d.detected_at_us, Some(1_700_000_000_123_456));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn t_d_optional_fields_absent() {
        let frame =
            parse_line("N2: T_D: DE:AD:BE:EF:00:01 Hits=3 RSSI:-80 Type:WiFi").unwrap();
        match frame.body {
            Message::TargetData(d) => {
                assert_eq!(d.hits, 3);
                assert!(!d.is_ble);
                assert!(d.lat_lon.is_none());
                assert!(d.hdop.is_none());
                assert!(d.detected_at_us.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn oversize_line_rejected_before_parsing() {
        let line = format!("N1: {}", "X".repeat(MAX_LINE_BYTES));
        assert!(matches!(parse_line(&line), Err(ParseError::TooLong(_))));
    }

    #[test]
    fn targeting_prefix() {
        let f = parse_line("@ALL N1: TRIANGULATE_STOP").unwrap();
        assert_eq!(f.dest, Some(Dest::All));
        assert!(f.addressed_to(&node("N2")));

        let f = parse_line("@N3 N1: TRI_START_ACK").unwrap();
        assert!(f.addressed_to(&node("N3")));
        assert!(!f.addressed_to(&node("N2")));
    }

    #[test]
    fn triangulate_start_mac_and_identity() {
        let f = parse_line("N1: TRIANGULATE_START:AA:BB:CC:DD:EE:FF:30:N1:2").unwrap();
        match f.body {
            Message::TriangulateStart { target, secs, initiator, env } => {
                assert!(matches!(target, TargetRef::Mac(_)));
                assert_eq!(secs, 30);
                assert_eq!(initiator, node("N1"));
                assert_eq!(env, RfEnvironment::Indoor);
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let f = parse_line("N1: TRIANGULATE_START:T-0a9f:60:N1:0").unwrap();
        assert!(matches!(
            f.body,
            Message::TriangulateStart { target: TargetRef::Identity(_), .. }
        ));
    }

    #[test]
    fn cycle_start_empty_node_list() {
        let f = parse_line("N1: TRI_CYCLE_START:123456:").unwrap();
        match f.body {
            Message::TriCycleStart { start_ms, nodes } => {
                assert_eq!(start_ms, 123456);
                assert!(nodes.is_empty());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn time_sync_round_trip() {
        let req = Message::TimeSyncReq {
            epoch_s: 1_700_000_000,
            subsec_cs: 42,
            tx_micros_lo32: 0xDEAD_BEEF,
        };
        let line = Frame::new(node("N9"), req.clone()).encode();
        assert_eq!(parse_line(&line).unwrap().body, req);

        let resp = Message::TimeSyncResp {
            epoch_s: 1_700_000_000,
            subsec_cs: 42,
            tx_micros_lo32: 7,
            prop_delay_us: 1800,
        };
        let line = Frame::new(node("N9"), resp.clone()).encode();
        assert_eq!(parse_line(&line).unwrap().body, resp);
    }

    #[test]
    fn unknown_body_survives() {
        let f = parse_line("N1: FUTURE_COMMAND:42").unwrap();
        assert_eq!(f.body, Message::Unknown("FUTURE_COMMAND:42".to_string()));
    }

    #[test]
    fn nonprintable_stripped() {
        let f = parse_line("N1: TRI_START_ACK\u{7}\u{1b}").unwrap();
        assert_eq!(f.body, Message::TriStartAck);
    }
}
