//! Rate-limited mesh bus.
//!
//! The LoRa serial bridge tolerates roughly one full line per refill
//! interval, so all outgoing traffic draws from a byte-denominated token
//! bucket. Stop traffic (`TRIANGULATE_STOP`, `*_STOP_ACK`) is priority: it
//! bypasses the bucket entirely and consumes no tokens. Non-priority sends
//! may wait up to the configured mesh send interval for tokens, otherwise
//! they are dropped with a log line — the protocol is built to tolerate loss.
//!
//! Transport is abstracted behind [`MeshLink`]: production uses the UART
//! bridge ([`serial::SerialLink`]), tests and the simulator use an in-memory
//! channel pair.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use meshloc_types::wire::{Frame, MAX_LINE_BYTES};

const MAX_TOKENS: usize = 400;
const TOKENS_PER_REFILL: usize = 200;
const REFILL_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("mesh line exceeds 200 bytes ({0})")]
    Oversize(usize),
    #[error("serial port error: {0}")]
    Serial(String),
    #[error("mesh link closed")]
    Closed,
}

// ── Transport abstraction ─────────────────────────────────────────────────────

/// One-way line transmitter. Implementations must not block beyond writing
/// into an OS or channel buffer.
pub trait MeshLink: Send + Sync {
    fn send_line(&self, line: &str) -> Result<(), BusError>;
}

/// In-memory link: lines land on the paired receiver. Used by unit tests and
/// the simulator hub.
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelLink {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MeshLink for ChannelLink {
    fn send_line(&self, line: &str) -> Result<(), BusError> {
        self.tx.send(line.to_string()).map_err(|_| BusError::Closed)
    }
}

// ── Token bucket ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TokenBucket {
    tokens: usize,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self { tokens: MAX_TOKENS, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= REFILL_INTERVAL {
            self.tokens = (self.tokens + TOKENS_PER_REFILL).min(MAX_TOKENS);
            self.last_refill = now;
        }
    }

    fn can_send(&mut self, len: usize) -> bool {
        self.refill();
        self.tokens >= len
    }

    fn consume(&mut self, len: usize) {
        self.tokens = self.tokens.saturating_sub(len);
    }

    fn wait_time(&mut self, len: usize) -> Duration {
        self.refill();
        if self.tokens >= len {
            return Duration::ZERO;
        }
        let needed = len - self.tokens;
        REFILL_INTERVAL
            .mul_f64((needed as f64 / TOKENS_PER_REFILL as f64).ceil())
    }

    fn flush(&mut self) {
        self.tokens = MAX_TOKENS;
        self.last_refill = Instant::now();
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

fn is_priority(line: &str) -> bool {
    line.contains("TRIANGULATE_STOP") || line.contains("STOP_ACK")
}

pub struct MeshBus {
    link: Arc<dyn MeshLink>,
    bucket: Mutex<TokenBucket>,
    send_interval: Duration,
}

impl MeshBus {
    pub fn new(link: Arc<dyn MeshLink>, send_interval: Duration) -> Self {
        Self { link, bucket: Mutex::new(TokenBucket::new()), send_interval }
    }

    /// Send one line. Returns `Ok(true)` when transmitted, `Ok(false)` when
    /// dropped by rate limiting. Priority lines always attempt transmission
    /// and never consume tokens.
    pub async fn send(&self, line: &str, allow_wait: bool) -> Result<bool, BusError> {
        // Account for the newline the link appends.
        let len = line.len() + 2;
        if line.len() > MAX_LINE_BYTES {
            return Err(BusError::Oversize(line.len()));
        }

        if is_priority(line) {
            self.link.send_line(line)?;
            return Ok(true);
        }

        let mut bucket = self.bucket.lock().await;
        if !bucket.can_send(len) {
            let wait = bucket.wait_time(len);
            if allow_wait && wait <= self.send_interval {
                drop(bucket);
                debug!(?wait, "rate limit: waiting for tokens");
                tokio::time::sleep(wait).await;
                bucket = self.bucket.lock().await;
                bucket.refill();
            } else {
                warn!(?wait, len, "rate limit: dropping mesh line");
                return Ok(false);
            }
        }
        self.link.send_line(line)?;
        bucket.consume(len);
        Ok(true)
    }

    pub async fn send_frame(&self, frame: &Frame, allow_wait: bool) -> Result<bool, BusError> {
        self.send(&frame.encode(), allow_wait).await
    }

    /// Reset tokens to full. Used before emitting final results so the fused
    /// fix is never dropped mid-publish.
    pub async fn flush(&self) {
        self.bucket.lock().await.flush();
        debug!("rate limiter flushed");
    }
}

// ── Serial transport ──────────────────────────────────────────────────────────

pub mod serial {
    use std::io::Read;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// UART bridge to the LoRa mesh radio (115200 8N1). A dedicated blocking
    /// reader thread accumulates bytes into line-atomic frames and forwards
    /// them over a bounded channel.
    pub struct SerialLink {
        port: StdMutex<Box<dyn serialport::SerialPort>>,
    }

    impl SerialLink {
        pub fn open(path: &str, baud: u32) -> Result<(Self, mpsc::Receiver<String>), BusError> {
            let port = serialport::new(path, baud)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| BusError::Serial(e.to_string()))?;
            let reader = port
                .try_clone()
                .map_err(|e| BusError::Serial(e.to_string()))?;

            let (tx, rx) = mpsc::channel(64);
            std::thread::Builder::new()
                .name("mesh-serial-rx".into())
                .spawn(move || read_loop(reader, tx))
                .map_err(|e| BusError::Serial(e.to_string()))?;

            Ok((Self { port: StdMutex::new(port) }, rx))
        }
    }

    fn read_loop(mut port: Box<dyn serialport::SerialPort>, tx: mpsc::Sender<String>) {
        let mut pending = Vec::with_capacity(256);
        let mut buf = [0u8; 256];
        loop {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == b'\n' {
                            let line = String::from_utf8_lossy(&pending).into_owned();
                            pending.clear();
                            if !line.is_empty() && tx.blocking_send(line).is_err() {
                                return;
                            }
                        } else if pending.len() < 2 * MAX_LINE_BYTES {
                            pending.push(b);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("mesh serial read failed: {e}");
                    return;
                }
            }
        }
    }

    impl MeshLink for SerialLink {
        fn send_line(&self, line: &str) -> Result<(), BusError> {
            let mut port = self.port.lock().map_err(|_| BusError::Closed)?;
            use std::io::Write;
            port.write_all(line.as_bytes())
                .and_then(|_| port.write_all(b"\r\n"))
                .map_err(|e| BusError::Serial(e.to_string()))
        }
    }
}

/// Link that discards everything; stands in when no mesh radio is attached.
pub struct NullLink;

impl MeshLink for NullLink {
    fn send_line(&self, _line: &str) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (MeshBus, mpsc::UnboundedReceiver<String>) {
        let (link, rx) = ChannelLink::pair();
        (MeshBus::new(Arc::new(link), Duration::from_millis(3000)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_exhaustion_drops_without_wait() {
        let (bus, mut rx) = bus();
        let line = "N1: ".to_string() + &"D".repeat(150);
        // 400 tokens, ~156 bytes/line: two pass, third is dropped.
        assert!(bus.send(&line, false).await.unwrap());
        assert!(bus.send(&line, false).await.unwrap());
        assert!(!bus.send(&line, false).await.unwrap());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_send_goes_through_after_refill() {
        let (bus, mut rx) = bus();
        let line = "N1: ".to_string() + &"D".repeat(150);
        assert!(bus.send(&line, false).await.unwrap());
        assert!(bus.send(&line, false).await.unwrap());
        // Third waits one refill interval, then transmits.
        assert!(bus.send(&line, true).await.unwrap());
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn priority_bypasses_empty_bucket() {
        let (bus, mut rx) = bus();
        let filler = "N1: ".to_string() + &"D".repeat(190);
        let _ = bus.send(&filler, false).await.unwrap();
        let _ = bus.send(&filler, false).await.unwrap();
        assert!(bus.send("@ALL N1: TRIANGULATE_STOP", false).await.unwrap());
        assert!(bus.send("N2: TRIANGULATE_STOP_ACK", false).await.unwrap());
        let mut lines = Vec::new();
        while let Ok(l) = rx.try_recv() {
            lines.push(l);
        }
        assert!(lines.iter().any(|l| l.contains("TRIANGULATE_STOP")));
        assert!(lines.iter().any(|l| l.contains("STOP_ACK")));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_restores_full_burst() {
        let (bus, mut rx) = bus();
        let line = "N1: ".to_string() + &"D".repeat(150);
        let _ = bus.send(&line, false).await.unwrap();
        let _ = bus.send(&line, false).await.unwrap();
        assert!(!bus.send(&line, false).await.unwrap());
        bus.flush().await;
        assert!(bus.send(&line, false).await.unwrap());
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_line_rejected() {
        let (bus, _rx) = bus();
        let line = "X".repeat(MAX_LINE_BYTES + 1);
        assert!(matches!(bus.send(&line, false).await, Err(BusError::Oversize(_))));
    }
}
