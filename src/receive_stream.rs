use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::packet::Packet;
use crate::peer::PeerId;

/// A gap or overlap in a sender's fragment numbering, i.e. at least one fragment was lost or
///  duplicated on the way. Reassembly recovers by discarding the partial object and waiting
///  for the start of the next series.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReassemblyError {
    pub sender: PeerId,
    pub expected_series: u32,
    pub expected_fragment: u32,
    pub got_series: u32,
    pub got_fragment: u32,
}

impl Display for ReassemblyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "reassembly failure for peer {}: expected fragment {} of series {}, got fragment {} of series {}",
            self.sender, self.expected_fragment, self.expected_series, self.got_fragment, self.got_series)
    }
}

impl std::error::Error for ReassemblyError {}

/// Reassembles one sender's fragment series back into contiguous objects.
///
/// Fragments of a series arrive strictly in order (they travel the same chain of stream
///  connections), so any numbering mismatch means actual loss - e.g. a dead hop dropping the
///  tail of a series. That surfaces as one [ReassemblyError] per broken series, and the stream
///  resets to wait for the next series' first fragment.
pub struct ReceiveStream {
    sender: PeerId,
    open: Option<OpenSeries>,
    completed: VecDeque<Result<Bytes, ReassemblyError>>,
}

struct OpenSeries {
    series_id: u32,
    expected_fragment: u32,
    assembled: BytesMut,
}

impl ReceiveStream {
    pub fn new(sender: PeerId) -> ReceiveStream {
        ReceiveStream {
            sender,
            open: None,
            completed: VecDeque::new(),
        }
    }

    /// Feed one arriving fragment. Returns true if this made at least one new completed entry
    ///  available via [Self::pop_completed].
    pub fn on_fragment(&mut self, packet: Packet) -> bool {
        match self.open.take() {
            None => {
                self.start_series(packet)
            }
            Some(open) => {
                if packet.series_id == open.series_id && packet.fragment == open.expected_fragment {
                    return self.append(open, packet);
                }

                let error = ReassemblyError {
                    sender: self.sender,
                    expected_series: open.series_id,
                    expected_fragment: open.expected_fragment,
                    got_series: packet.series_id,
                    got_fragment: packet.fragment,
                };
                warn!("{}", error);
                self.completed.push_back(Err(error));

                // the offending fragment may well be the start of the next series
                self.start_series(packet);
                true
            }
        }
    }

    fn start_series(&mut self, packet: Packet) -> bool {
        if packet.fragment != 0 {
            warn!("dropping fragment {} of series {} from peer {}: no series in progress",
                packet.fragment, packet.series_id, self.sender);
            return false;
        }

        let mut assembled = BytesMut::with_capacity(packet.payload.len());
        assembled.put_slice(packet.payload.as_ref());

        if packet.is_last {
            self.completed.push_back(Ok(assembled.freeze()));
            true
        }
        else {
            self.open = Some(OpenSeries {
                series_id: packet.series_id,
                expected_fragment: 1,
                assembled,
            });
            false
        }
    }

    fn append(&mut self, mut open: OpenSeries, packet: Packet) -> bool {
        open.assembled.put_slice(packet.payload.as_ref());

        if packet.is_last {
            self.completed.push_back(Ok(open.assembled.freeze()));
            true
        }
        else {
            open.expected_fragment += 1;
            self.open = Some(open);
            false
        }
    }

    pub fn pop_completed(&mut self) -> Option<Result<Bytes, ReassemblyError>> {
        self.completed.pop_front()
    }

    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }
}
