use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::anyhow;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::LrmcConfig;
use crate::packet::{self, Packet, WireMessage};
use crate::packet_pool::{PacketPool, PooledBuf};
use crate::peer::{PeerId, PeerIdentity};
use crate::registry::PeerRegistry;
use crate::relay_queue::RelayQueue;
use crate::transport::{Connection, FragmentReceiver, Transport};

/// The chain forwarding engine: fragments go out with their route embedded, and every hop
///  delivers locally, strips itself off the route and forwards the rest.
///
/// Incoming packets are parsed on the network upcall but handled on a dedicated relay task,
///  decoupled by a small bounded queue - the network read path never waits for a downstream
///  connection to come up.
pub struct ChainMulticast {
    inner: Arc<EngineInner>,
    relay_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

struct EngineInner {
    config: LrmcConfig,
    transport: Arc<dyn Transport>,
    receiver: Arc<dyn FragmentReceiver>,
    pool: PacketPool,
    queue: RelayQueue<WireMessage>,
    routing: Mutex<RoutingState>,
    bytes_sent: AtomicU64,
}

struct RoutingState {
    registry: PeerRegistry,
    connections: FxHashMap<PeerId, Arc<dyn Connection>>,

    /// peers a connect or send recently failed for, with the time of the failure. They are
    ///  skipped during the cooldown so a single fragmented multicast does not retry a dead
    ///  hop once per fragment.
    dead_peers: FxHashMap<PeerId, Instant>,

    /// the route currently used for locally originated fragments
    destinations: Vec<PeerId>,
    explicit_destinations: bool,
}

impl ChainMulticast {
    pub fn new(
        config: LrmcConfig,
        local: PeerIdentity,
        transport: Arc<dyn Transport>,
        receiver: Arc<dyn FragmentReceiver>,
    ) -> anyhow::Result<Arc<ChainMulticast>> {
        config.validate()?;

        let pool = PacketPool::new(config.fragment_payload_size, config.max_pool_size);
        let queue = RelayQueue::new(config.relay_queue_capacity);

        let inner = Arc::new(EngineInner {
            config,
            transport,
            receiver,
            pool,
            queue,
            routing: Mutex::new(RoutingState {
                registry: PeerRegistry::new(local),
                connections: FxHashMap::default(),
                dead_peers: FxHashMap::default(),
                destinations: Vec::new(),
                explicit_destinations: false,
            }),
            bytes_sent: AtomicU64::new(0),
        });

        let relay_task = tokio::spawn({
            let inner = inner.clone();
            async move {
                inner.relay_loop().await;
            }
        });

        Ok(Arc::new(ChainMulticast {
            inner,
            relay_task: std::sync::Mutex::new(Some(relay_task)),
            listener: std::sync::Mutex::new(None),
            finished: AtomicBool::new(false),
        }))
    }

    /// The payload buffer pool - callers slice their data into buffers acquired here.
    pub fn pool(&self) -> PacketPool {
        self.inner.pool.clone()
    }

    /// Send one fragment along the currently configured route. With an empty route there is
    ///  nobody to send to, and the final fragment completes immediately.
    pub async fn send(&self, series_id: u32, fragment: u32, is_last: bool, payload: PooledBuf) -> anyhow::Result<()> {
        let mut state = self.inner.routing.lock().await;

        let sender = state.registry.self_id()
            .ok_or_else(|| anyhow!("local peer is not registered"))?;

        if state.destinations.is_empty() {
            drop(state);
            if is_last {
                self.inner.receiver.on_send_done(series_id).await;
            }
            return Ok(());
        }

        let packet = Packet {
            sender,
            series_id,
            fragment,
            is_last,
            destinations: state.destinations.clone(),
            payload,
            originated_locally: true,
        };

        if !self.inner.forward(&mut state, &packet).await {
            warn!("fragment {} of series {} could not be sent to any destination", fragment, series_id);
        }
        Ok(())
    }

    /// Network upcall for a raw packet. This only parses and enqueues - the actual handling
    ///  happens on the relay task.
    pub async fn on_packet(&self, data: &[u8]) {
        match packet::deser(data, &self.inner.pool) {
            Ok(msg) => {
                if self.inner.queue.enqueue(msg).await.is_err() {
                    trace!("dropping incoming packet, relay is stopped");
                }
            }
            Err(e) => {
                warn!("discarding malformed packet: {}", e);
            }
        }
    }

    pub async fn add_peer(&self, identity: PeerIdentity) {
        self.inner.routing.lock().await
            .registry.add_peer(identity);
    }

    /// A peer left the group. Its connection is closed and it disappears from the default
    ///  route; its numeric id is never reused.
    pub async fn remove_peer(&self, identity: &PeerIdentity) {
        let mut state = self.inner.routing.lock().await;
        if let Some(id) = state.registry.resolve(identity) {
            if let Some(conn) = state.connections.remove(&id) {
                conn.close().await;
            }
            state.dead_peers.remove(&id);
            state.destinations.retain(|&d| d != id);
        }
        state.registry.remove_peer(identity);
    }

    /// Reachability hint from outside (e.g. the membership layer's failure detector): start
    ///  the dead-peer cooldown for this peer right away instead of waiting for a send to fail.
    pub async fn peer_died(&self, identity: &PeerIdentity) {
        let mut state = self.inner.routing.lock().await;
        if let Some(id) = state.registry.resolve(identity) {
            if let Some(conn) = state.connections.remove(&id) {
                conn.close().await;
            }
            state.dead_peers.insert(id, Instant::now());
        }
    }

    /// Set an explicit route for subsequent sends. Unknown peers are skipped with a warning
    ///  rather than failing the whole send.
    pub async fn set_destinations(&self, destinations: &[PeerIdentity]) {
        let mut state = self.inner.routing.lock().await;

        let mut route = Vec::with_capacity(destinations.len());
        for identity in destinations {
            match state.registry.resolve(identity) {
                Some(id) => route.push(id),
                None => warn!("skipping unknown destination {:?}", identity),
            }
        }

        state.destinations = route;
        state.explicit_destinations = true;
    }

    /// Route to all currently known peers, refreshing the route only when membership changed
    ///  since it was last computed.
    pub async fn use_current_peers(&self) {
        let mut guard = self.inner.routing.lock().await;
        let state = &mut *guard;

        let sort = self.inner.config.cluster_aware_sorting;
        let identities = if state.explicit_destinations {
            state.explicit_destinations = false;
            Some(state.registry.current_destinations(sort))
        }
        else {
            state.registry.destinations_if_changed(sort)
        };

        if let Some(identities) = identities {
            state.destinations = identities.iter()
                .filter_map(|identity| state.registry.resolve(identity))
                .collect();
        }
    }

    pub async fn identity_of(&self, id: PeerId) -> Option<PeerIdentity> {
        self.inner.routing.lock().await
            .registry.identity_of(id)
            .cloned()
    }

    /// Total bytes put on the wire so far, optionally resetting the counter.
    pub fn bytes_sent(&self, reset: bool) -> u64 {
        if reset {
            self.inner.bytes_sent.swap(0, Ordering::Relaxed)
        }
        else {
            self.inner.bytes_sent.load(Ordering::Relaxed)
        }
    }

    /// Hand the inbound listener task over to the engine: [Self::done] aborts it, so shutting
    ///  the engine down also closes the listening endpoint.
    pub fn adopt_listener(&self, handle: JoinHandle<()>) {
        *self.listener.lock().unwrap() = Some(handle);
    }

    /// Shut down: stop accepting packets, wait (bounded) for the relay task to wind down, and
    ///  close all connections (including an adopted listener). Idempotent.
    pub async fn done(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener.abort();
        }

        self.inner.queue.close();

        let handle = self.relay_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.inner.config.shutdown_join_timeout, handle).await.is_err() {
                warn!("relay task did not finish in time, aborting it");
                abort.abort();
            }
        }

        let connections: Vec<Arc<dyn Connection>> = {
            let mut state = self.inner.routing.lock().await;
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close().await;
        }
    }
}

impl EngineInner {
    async fn relay_loop(&self) {
        while let Some(msg) = self.queue.dequeue().await {
            match msg {
                WireMessage::Data(packet) => {
                    self.relay_data(packet).await;
                }
                WireMessage::SeriesDone { origin, series_id } => {
                    let self_id = self.routing.lock().await.registry.self_id();
                    if self_id == Some(origin) {
                        self.receiver.on_send_done(series_id).await;
                    }
                    else {
                        warn!("completion for series {} of peer {} arrived at the wrong node", series_id, origin);
                    }
                }
            }
        }
        debug!("relay task winding down");
    }

    async fn relay_data(&self, packet: Packet) {
        {
            let mut state = self.routing.lock().await;
            if !packet.destinations.is_empty() {
                if !self.forward(&mut state, &packet).await {
                    warn!("fragment {} of series {} from {} could not be forwarded to any remaining destination",
                        packet.fragment, packet.series_id, packet.sender);
                }
            }
            else if packet.is_last && !packet.originated_locally {
                // end of the chain: notify the series' origin
                self.send_series_done(&mut state, packet.sender, packet.series_id).await;
            }
        }

        self.receiver.on_fragment(packet).await;
    }

    /// Send a packet to the first reachable destination on its route, walking past dead hops.
    ///  Returns false if every destination was unreachable.
    async fn forward(&self, state: &mut RoutingState, packet: &Packet) -> bool {
        for idx in 0..packet.destinations.len() {
            let dest = packet.destinations[idx];

            let conn = match self.get_connection(state, dest).await {
                Some(conn) => conn,
                None => continue,
            };

            let mut wire = BytesMut::with_capacity(packet.wire_len());
            packet.ser(idx, &mut wire);

            match conn.send_packet(&wire).await {
                Ok(()) => {
                    self.bytes_sent.fetch_add(wire.len() as u64, Ordering::Relaxed);
                    return true;
                }
                Err(e) => {
                    warn!("send to peer {} failed: {}", dest, e);
                    self.mark_dead(state, dest).await;
                }
            }
        }
        false
    }

    async fn send_series_done(&self, state: &mut RoutingState, origin: PeerId, series_id: u32) {
        let conn = match self.get_connection(state, origin).await {
            Some(conn) => conn,
            None => {
                warn!("origin {} of series {} is unreachable, dropping completion", origin, series_id);
                return;
            }
        };

        let mut wire = BytesMut::with_capacity(8);
        packet::ser_series_done(origin, series_id, &mut wire);

        match conn.send_packet(&wire).await {
            Ok(()) => {
                self.bytes_sent.fetch_add(wire.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("sending completion for series {} to {} failed: {}", series_id, origin, e);
                self.mark_dead(state, origin).await;
            }
        }
    }

    /// Look up or establish the connection to a peer. `None` means the peer should be skipped
    ///  for now: unknown, inside the dead-peer cooldown, or failed the (single) reconnect.
    async fn get_connection(&self, state: &mut RoutingState, dest: PeerId) -> Option<Arc<dyn Connection>> {
        if let Some(conn) = state.connections.get(&dest) {
            return Some(conn.clone());
        }

        if let Some(&marked_at) = state.dead_peers.get(&dest) {
            if marked_at.elapsed() < self.config.zombie_cooldown {
                trace!("peer {} is in its dead-peer cooldown, skipping", dest);
                return None;
            }
            // cooldown expired, allow exactly one new attempt
            state.dead_peers.remove(&dest);
        }

        let identity = match state.registry.identity_of(dest) {
            Some(identity) => identity.clone(),
            None => {
                debug!("peer {} is not (or no longer) registered, skipping", dest);
                return None;
            }
        };

        match self.transport.connect(&identity, self.config.connect_timeout).await {
            Ok(conn) => {
                state.connections.insert(dest, conn.clone());
                Some(conn)
            }
            Err(e) => {
                warn!("connecting to peer {:?} failed: {}", identity, e);
                state.dead_peers.insert(dest, Instant::now());
                self.transport.report_suspect_dead(&identity).await;
                None
            }
        }
    }

    async fn mark_dead(&self, state: &mut RoutingState, dest: PeerId) {
        if let Some(conn) = state.connections.remove(&dest) {
            conn.close().await;
        }
        state.dead_peers.insert(dest, Instant::now());

        if let Some(identity) = state.registry.identity_of(dest).cloned() {
            self.transport.report_suspect_dead(&identity).await;
        }
    }
}
