//! In-memory stand-in for the LoRa serial bus.
//!
//! Every attached node gets a [`meshloc_node::bus::MeshLink`] whose lines are
//! fanned out to all other nodes after a configurable latency. A drop rule
//! lets scenarios black-hole selected traffic (lost ACKs, dead peers)
//! without touching the nodes themselves. Senders never hear their own
//! transmissions, matching the radio.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use meshloc_node::bus::{BusError, MeshLink};

/// Decides whether a line from `sender` is delivered. Return false to drop.
pub type DropRule = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

struct Port {
    id: String,
    tx: mpsc::Sender<String>,
}

struct HubInner {
    ports: StdMutex<Vec<Port>>,
    latency: Duration,
    rule: StdMutex<Option<DropRule>>,
}

#[derive(Clone)]
pub struct SimHub {
    inner: Arc<HubInner>,
}

impl SimHub {
    pub fn new(latency: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                ports: StdMutex::new(Vec::new()),
                latency,
                rule: StdMutex::new(None),
            }),
        }
    }

    /// Install a delivery rule: `rule(sender_id, line) -> deliver?`.
    pub fn set_drop_rule(&self, rule: DropRule) {
        *self.inner.rule.lock().unwrap() = Some(rule);
    }

    pub fn clear_drop_rule(&self) {
        *self.inner.rule.lock().unwrap() = None;
    }

    /// Attach a node; returns its transmit link and receive stream.
    pub fn attach(&self, id: &str) -> (SimLink, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(256);
        self.inner.ports.lock().unwrap().push(Port { id: id.to_string(), tx });
        (SimLink { hub: self.inner.clone(), id: id.to_string() }, rx)
    }

    /// Attach a silent observer that records all traffic.
    pub fn monitor(&self) -> mpsc::Receiver<String> {
        let (_link, rx) = self.attach("@mon");
        rx
    }
}

pub struct SimLink {
    hub: Arc<HubInner>,
    id: String,
}

impl MeshLink for SimLink {
    fn send_line(&self, line: &str) -> Result<(), BusError> {
        if let Some(rule) = self.hub.rule.lock().unwrap().as_ref() {
            if !rule(&self.id, line) {
                debug!(from = %self.id, "hub dropped line by rule");
                return Ok(());
            }
        }
        let latency = self.hub.latency;
        let ports = self.hub.ports.lock().unwrap();
        for port in ports.iter() {
            if port.id == self.id {
                continue;
            }
            let tx = port.tx.clone();
            let line = line.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = tx.send(line).await;
            });
        }
        Ok(())
    }
}
