use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::packet_pool::{PacketPool, PooledBuf};
use crate::peer::PeerId;

/// Flag bit in the fragment number marking the final fragment of a series.
pub const LAST_FRAGMENT: u32 = 1 << 31;

const KIND_DATA: u8 = 0;
const KIND_SERIES_DONE: u8 = 1;

/// One fragment travelling along a multicast chain.
///
/// A packet carries the remaining route as an explicit list of destination ids: each hop
///  delivers the payload locally and forwards the packet - with itself stripped from the
///  front of the list - to the next destination.
pub struct Packet {
    /// the peer that originated the series, i.e. the reassembly key
    pub sender: PeerId,
    pub series_id: u32,
    pub fragment: u32,
    pub is_last: bool,
    /// the rest of the route, not including the local node
    pub destinations: Vec<PeerId>,
    pub payload: PooledBuf,
    /// set for packets created by the local send path, never for packets off the wire. Local
    ///  packets must not trigger a completion notification back to their (local) origin.
    pub originated_locally: bool,
}

/// A parsed wire message, either a routed data fragment or the end-of-chain notification
///  travelling back to a series' origin.
pub enum WireMessage {
    Data(Packet),
    SeriesDone {
        origin: PeerId,
        series_id: u32,
    },
}

impl Packet {
    /// Serialize this packet for the hop at `from_dest`, i.e. with destinations `0..from_dest`
    ///  already stripped off the route.
    pub fn ser(&self, from_dest: usize, buf: &mut BytesMut) {
        buf.put_u8(KIND_DATA);
        buf.put_u16(self.sender.to_raw());
        buf.put_u32(self.series_id);

        let mut fragment = self.fragment;
        if self.is_last {
            fragment |= LAST_FRAGMENT;
        }
        buf.put_u32(fragment);

        let tail = &self.destinations[from_dest + 1..];
        buf.put_usize_varint(tail.len());
        for dest in tail {
            buf.put_u16(dest.to_raw());
        }

        buf.put_usize_varint(self.payload.len());
        buf.put_slice(self.payload.as_ref());
    }

    /// Upper bound for the serialized size of this packet, for pre-sizing the wire buffer.
    pub fn wire_len(&self) -> usize {
        1 + 2 + 4 + 4
            + 5 + 2 * self.destinations.len()
            + 5 + self.payload.len()
    }
}

/// Serialize the completion notification for a finished series, addressed back to `origin`.
pub fn ser_series_done(origin: PeerId, series_id: u32, buf: &mut BytesMut) {
    buf.put_u8(KIND_SERIES_DONE);
    buf.put_u16(origin.to_raw());
    buf.put_u32(series_id);
}

/// Parse a wire message, copying a data packet's payload into a pooled buffer.
pub fn deser(mut buf: &[u8], pool: &PacketPool) -> anyhow::Result<WireMessage> {
    let kind = buf.try_get_u8()?;
    match kind {
        KIND_DATA => {
            let sender = PeerId::from_raw(buf.try_get_u16()?);
            let series_id = buf.try_get_u32()?;
            let raw_fragment = buf.try_get_u32()?;

            let num_destinations = buf.try_get_usize_varint()?;
            let mut destinations = Vec::with_capacity(num_destinations);
            for _ in 0..num_destinations {
                destinations.push(PeerId::from_raw(buf.try_get_u16()?));
            }

            let payload_len = buf.try_get_usize_varint()?;
            if buf.remaining() < payload_len {
                bail!("packet is truncated: payload of {} bytes announced, {} present", payload_len, buf.remaining());
            }
            let mut payload = pool.acquire(payload_len);
            payload.put_slice(&buf[..payload_len]);

            Ok(WireMessage::Data(Packet {
                sender,
                series_id,
                fragment: raw_fragment & !LAST_FRAGMENT,
                is_last: raw_fragment & LAST_FRAGMENT != 0,
                destinations,
                payload,
                originated_locally: false,
            }))
        }
        KIND_SERIES_DONE => {
            let origin = PeerId::from_raw(buf.try_get_u16()?);
            let series_id = buf.try_get_u32()?;
            Ok(WireMessage::SeriesDone { origin, series_id })
        }
        _ => bail!("unknown packet kind {}", kind),
    }
}
