use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::packet::Packet;
use crate::peer::PeerIdentity;

/// An established point-to-point connection to one peer. Implementations must frame each
///  `send_packet` call so the receiving side gets it back as one unit.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send_packet(&self, data: &[u8]) -> anyhow::Result<()>;

    async fn close(&self);
}

/// Factory for connections, and the back channel for reachability observations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, to: &PeerIdentity, timeout: Duration) -> anyhow::Result<Arc<dyn Connection>>;

    /// Called when a send or connect to `peer` failed. Purely advisory - the membership layer
    ///  may use it to speed up failure detection.
    async fn report_suspect_dead(&self, peer: &PeerIdentity);
}

/// Where locally delivered fragments and completion notifications go, i.e. the upward-facing
///  edge of the forwarding engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FragmentReceiver: Send + Sync {
    async fn on_fragment(&self, packet: Packet);

    /// A series originated locally has reached the end of its chain.
    async fn on_send_done(&self, series_id: u32);
}
