//! In-process wiring for tests: a hub connecting multicast engines directly, with switches
//!  for simulating dead nodes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::engine::ChainMulticast;
use crate::peer::PeerIdentity;
use crate::transport::{Connection, Transport};

/// Connects any number of engines by peer name, delivering packets by direct upcall. A node
///  marked down refuses new connections and fails in-flight sends, like a crashed process.
pub struct LoopbackHub {
    nodes: Mutex<FxHashMap<String, Arc<ChainMulticast>>>,
    down: Mutex<HashSet<String>>,
    suspected: Mutex<Vec<String>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<LoopbackHub> {
        Arc::new(LoopbackHub {
            nodes: Mutex::new(FxHashMap::default()),
            down: Mutex::new(HashSet::new()),
            suspected: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, name: &str, engine: Arc<ChainMulticast>) {
        self.nodes.lock().unwrap().insert(name.to_string(), engine);
    }

    pub fn set_down(&self, name: &str, down: bool) {
        if down {
            self.down.lock().unwrap().insert(name.to_string());
        }
        else {
            self.down.lock().unwrap().remove(name);
        }
    }

    /// Peer names reported as suspect dead, in reporting order.
    pub fn suspected(&self) -> Vec<String> {
        self.suspected.lock().unwrap().clone()
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            hub: self.clone(),
        })
    }

    fn is_down(&self, name: &str) -> bool {
        self.down.lock().unwrap().contains(name)
    }

    fn engine(&self, name: &str) -> Option<Arc<ChainMulticast>> {
        self.nodes.lock().unwrap().get(name).cloned()
    }
}

struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, to: &PeerIdentity, _timeout: Duration) -> anyhow::Result<Arc<dyn Connection>> {
        if self.hub.is_down(&to.name) {
            bail!("peer {:?} is down", to);
        }
        if self.hub.engine(&to.name).is_none() {
            bail!("no node {:?} registered with the hub", to);
        }

        let conn: Arc<dyn Connection> = Arc::new(LoopbackConnection {
            hub: self.hub.clone(),
            to: to.name.clone(),
        });
        Ok(conn)
    }

    async fn report_suspect_dead(&self, peer: &PeerIdentity) {
        self.hub.suspected.lock().unwrap().push(peer.name.clone());
    }
}

struct LoopbackConnection {
    hub: Arc<LoopbackHub>,
    to: String,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send_packet(&self, data: &[u8]) -> anyhow::Result<()> {
        if self.hub.is_down(&self.to) {
            bail!("peer {} is down", self.to);
        }

        let engine = self.hub.engine(&self.to)
            .ok_or_else(|| anyhow!("node {} disappeared from the hub", self.to))?;
        engine.on_packet(data).await;
        Ok(())
    }

    async fn close(&self) {
    }
}
