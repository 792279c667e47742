use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::LrmcConfig;
use crate::demux::{ReceiveStreams, SeriesSink};
use crate::engine::ChainMulticast;
use crate::packet::Packet;
use crate::peer::{PeerId, PeerIdentity};
use crate::receive_stream::ReassemblyError;
use crate::send_stream::FragmentWriter;
use crate::transport::{FragmentReceiver, Transport};

/// Object (de)serialization at the multicast boundary.
pub trait ObjectCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> anyhow::Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> anyhow::Result<T>;
}

/// Default codec, using bincode's standard wire format via serde.
pub struct BincodeCodec;

impl<T: Serialize + DeserializeOwned> ObjectCodec<T> for BincodeCodec {
    fn encode(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
    }

    fn decode(&self, data: &[u8]) -> anyhow::Result<T> {
        let (value, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())?;
        Ok(value)
    }
}

/// Why an object did not make it to the application.
#[derive(Debug)]
pub enum ReceiveError {
    /// fragments were lost, the affected object is gone but the stream has recovered
    Reassembly(ReassemblyError),
    /// the object arrived intact but did not deserialize
    Decode(anyhow::Error),
    /// the multicaster was shut down
    Stopped,
}

impl Display for ReceiveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveError::Reassembly(e) => write!(f, "{}", e),
            ReceiveError::Decode(e) => write!(f, "object failed to deserialize: {}", e),
            ReceiveError::Stopped => write!(f, "multicaster is stopped"),
        }
    }
}

impl std::error::Error for ReceiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiveError::Reassembly(e) => Some(e),
            ReceiveError::Decode(e) => Some(e.as_ref()),
            ReceiveError::Stopped => None,
        }
    }
}

/// Notification that a locally sent object has traversed its whole chain, identified by the
///  series id [ObjectMulticaster::send] returned. Called on the relay task.
#[cfg_attr(test, automock)]
pub trait SendDoneUpcaller: Send + Sync {
    fn send_done(&self, series_id: u32);
}

/// Push-mode consumer of received objects. Called on the relay task, so implementations
///  should hand off rather than block.
pub trait ObjectUpcaller<T>: Send + Sync {
    fn on_object(&self, sender: PeerId, object: T);

    fn on_error(&self, sender: PeerId, error: ReceiveError) {
        warn!("discarding broken object from peer {}: {}", sender, error);
    }
}

/// Reliable object multicast: serialized objects are fragmented, routed along a chain through
///  all destinations, and reassembled per sender on the way.
///
/// Delivery is either pull ([Self::receive]) or push (an [ObjectUpcaller] fixed at
///  construction) - one of the two per instance, never both.
pub struct ObjectMulticaster<T> {
    engine: Arc<ChainMulticast>,
    shared: Arc<MulticastShared>,
    codec: Arc<dyn ObjectCodec<T>>,
    writer: tokio::sync::Mutex<WriterState>,
    pull_mode: bool,
}

struct WriterState {
    writer: FragmentWriter,
    explicit_destinations: bool,
}

/// The engine-facing side: counts payload bytes, demultiplexes fragments, and relays
///  completion notifications to the (optional) send-done upcaller.
struct MulticastShared {
    demux: Arc<ReceiveStreams>,
    send_done: std::sync::Mutex<Option<Arc<dyn SendDoneUpcaller>>>,
    bytes_read: AtomicU64,
}

#[async_trait]
impl FragmentReceiver for MulticastShared {
    async fn on_fragment(&self, packet: Packet) {
        self.bytes_read.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        self.demux.on_fragment(packet);
    }

    async fn on_send_done(&self, series_id: u32) {
        let upcaller = self.send_done.lock().unwrap().clone();
        if let Some(upcaller) = upcaller {
            upcaller.send_done(series_id);
        }
    }
}

/// Adapts completed byte series to the push-mode object upcaller.
struct PushSink<T> {
    codec: Arc<dyn ObjectCodec<T>>,
    upcaller: Arc<dyn ObjectUpcaller<T>>,
    _t: PhantomData<fn() -> T>,
}

impl<T> SeriesSink for PushSink<T> {
    fn on_series(&self, sender: PeerId, result: Result<Bytes, ReassemblyError>) {
        match result {
            Ok(bytes) => match self.codec.decode(&bytes) {
                Ok(object) => self.upcaller.on_object(sender, object),
                Err(e) => self.upcaller.on_error(sender, ReceiveError::Decode(e)),
            },
            Err(e) => self.upcaller.on_error(sender, ReceiveError::Reassembly(e)),
        }
    }
}

impl<T: 'static> ObjectMulticaster<T> {
    /// Pull-mode multicaster: received objects are fetched with [Self::receive].
    pub fn pull(
        config: LrmcConfig,
        local: PeerIdentity,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ObjectCodec<T>>,
    ) -> anyhow::Result<ObjectMulticaster<T>> {
        let demux = Arc::new(ReceiveStreams::pull());
        Self::new(config, local, transport, codec, demux, true)
    }

    /// Push-mode multicaster: received objects are handed to `upcaller` as they complete.
    pub fn push(
        config: LrmcConfig,
        local: PeerIdentity,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ObjectCodec<T>>,
        upcaller: Arc<dyn ObjectUpcaller<T>>,
    ) -> anyhow::Result<ObjectMulticaster<T>> {
        let sink = Arc::new(PushSink {
            codec: codec.clone(),
            upcaller,
            _t: PhantomData,
        });
        let demux = Arc::new(ReceiveStreams::push(sink));
        Self::new(config, local, transport, codec, demux, false)
    }

    fn new(
        config: LrmcConfig,
        local: PeerIdentity,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ObjectCodec<T>>,
        demux: Arc<ReceiveStreams>,
        pull_mode: bool,
    ) -> anyhow::Result<ObjectMulticaster<T>> {
        let shared = Arc::new(MulticastShared {
            demux,
            send_done: std::sync::Mutex::new(None),
            bytes_read: AtomicU64::new(0),
        });

        let engine = ChainMulticast::new(config, local, transport, shared.clone())?;
        let writer = FragmentWriter::new(engine.clone());

        Ok(ObjectMulticaster {
            engine,
            shared,
            codec,
            writer: tokio::sync::Mutex::new(WriterState {
                writer,
                explicit_destinations: false,
            }),
            pull_mode,
        })
    }

    /// Register an upcaller for chain-completion notifications of locally sent objects.
    pub fn set_send_done_upcaller(&self, upcaller: Arc<dyn SendDoneUpcaller>) {
        *self.shared.send_done.lock().unwrap() = Some(upcaller);
    }

    /// The underlying forwarding engine, for wiring up the network listener.
    pub fn engine(&self) -> Arc<ChainMulticast> {
        self.engine.clone()
    }

    /// Fix an explicit destination chain for subsequent [Self::send] calls, overriding the
    ///  default "all currently known peers".
    pub async fn set_destinations(&self, destinations: &[PeerIdentity]) {
        let mut state = self.writer.lock().await;
        self.engine.set_destinations(destinations).await;
        state.explicit_destinations = true;
    }

    /// Multicast an object, returning the series id that a completion notification will
    ///  carry. Destinations are all currently known peers unless an explicit chain was set.
    pub async fn send(&self, object: &T) -> anyhow::Result<u32> {
        self.send_impl(None, object).await
    }

    /// Multicast an object along an explicit destination chain, which stays in effect for
    ///  subsequent [Self::send] calls.
    pub async fn send_to(&self, destinations: &[PeerIdentity], object: &T) -> anyhow::Result<u32> {
        self.send_impl(Some(destinations), object).await
    }

    async fn send_impl(&self, destinations: Option<&[PeerIdentity]>, object: &T) -> anyhow::Result<u32> {
        let data = self.codec.encode(object)?;

        let mut state = self.writer.lock().await;
        match destinations {
            Some(destinations) => {
                self.engine.set_destinations(destinations).await;
                state.explicit_destinations = true;
            }
            None => {
                if !state.explicit_destinations {
                    self.engine.use_current_peers().await;
                }
            }
        }

        state.writer.write_series(&data).await
    }

    /// Pull mode only: wait for the next object from any sender. Objects from different
    ///  senders are delivered round-robin; a per-series loss surfaces as
    ///  [ReceiveError::Reassembly] and the affected stream keeps going.
    pub async fn receive(&self) -> Result<(PeerId, T), ReceiveError> {
        if !self.pull_mode {
            return Err(ReceiveError::Stopped);
        }

        match self.shared.demux.next_completed().await {
            None => Err(ReceiveError::Stopped),
            Some((sender, Ok(bytes))) => {
                match self.codec.decode(&bytes) {
                    Ok(object) => Ok((sender, object)),
                    Err(e) => Err(ReceiveError::Decode(e)),
                }
            }
            Some((_, Err(e))) => Err(ReceiveError::Reassembly(e)),
        }
    }

    pub async fn add_peer(&self, identity: PeerIdentity) {
        self.engine.add_peer(identity).await;
    }

    pub async fn remove_peer(&self, identity: &PeerIdentity) {
        self.engine.remove_peer(identity).await;
    }

    pub async fn peer_died(&self, identity: &PeerIdentity) {
        self.engine.peer_died(identity).await;
    }

    pub async fn identity_of(&self, id: PeerId) -> Option<PeerIdentity> {
        self.engine.identity_of(id).await
    }

    /// Payload bytes handed to the send side so far, optionally resetting the counter.
    pub async fn bytes_written(&self, reset: bool) -> u64 {
        self.writer.lock().await.writer.bytes_written(reset)
    }

    /// Payload bytes delivered locally so far, optionally resetting the counter.
    pub fn bytes_read(&self, reset: bool) -> u64 {
        if reset {
            self.shared.bytes_read.swap(0, Ordering::Relaxed)
        }
        else {
            self.shared.bytes_read.load(Ordering::Relaxed)
        }
    }

    /// Raw bytes put on the wire so far (including forwarded traffic), optionally resetting.
    pub fn bytes_sent(&self, reset: bool) -> u64 {
        self.engine.bytes_sent(reset)
    }

    /// Combined payload traffic through this instance, written plus read.
    pub async fn total_bytes(&self, reset: bool) -> u64 {
        self.bytes_written(reset).await + self.bytes_read(reset)
    }

    /// Shut down the engine and wake all pending [Self::receive] calls. Idempotent.
    pub async fn done(&self) {
        self.engine.done().await;
        self.shared.demux.close();
    }
}
