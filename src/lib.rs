//! Reliable application-level multicast over point-to-point stream connections.
//!
//! Objects are serialized, sliced into fragment series and routed along a chain: the sender
//!  puts the full destination list into each packet, and every hop delivers the payload
//!  locally, strips itself off the list and forwards the remainder to the next reachable
//!  destination. Unreachable hops are skipped (and remembered for a cooldown), so a single
//!  dead node does not break delivery to the rest of the chain. When the final fragment of a
//!  series reaches the end of its chain, a completion notification travels straight back to
//!  the origin.
//!
//! Wire format of a data packet:
//!
//! ```ascii
//! | kind: u8 = 0 | sender id: u16 | series id: u32 | fragment: u32 (bit 31 = last) |
//! | #destinations: varint | destination ids: u16 each | payload length: varint | payload |
//! ```
//!
//! A completion packet is `kind: u8 = 1 | origin id: u16 | series id: u32`.
//!
//! Peer ids are small dense numbers assigned from membership events, which arrive in the same
//!  order everywhere, so the ids are consistent across nodes and safe to use on the wire.

pub mod config;
pub mod demux;
pub mod engine;
pub mod multicaster;
pub mod packet;
pub mod packet_pool;
pub mod peer;
pub mod receive_stream;
pub mod registry;
pub mod relay_queue;
pub mod send_stream;
pub mod sorter;
pub mod tcp_transport;
pub mod test_util;
pub mod transport;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
