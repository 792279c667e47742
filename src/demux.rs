use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::packet::Packet;
use crate::peer::PeerId;
use crate::receive_stream::{ReassemblyError, ReceiveStream};

/// Push-mode consumer of reassembled objects (or per-series reassembly failures). Called on
///  the relay task, so implementations should hand off rather than block.
#[cfg_attr(test, automock)]
pub trait SeriesSink: Send + Sync {
    fn on_series(&self, sender: PeerId, result: Result<Bytes, ReassemblyError>);
}

/// Demultiplexes arriving fragments into one [ReceiveStream] per sender and hands completed
///  objects onwards.
///
/// Two delivery modes, fixed at construction: push (a [SeriesSink] is invoked as objects
///  complete) and pull (consumers await [Self::next_completed], with round-robin fairness
///  across senders so one busy sender cannot starve the others).
pub struct ReceiveStreams {
    state: Mutex<DemuxState>,
    readable: Notify,
    sink: Option<Arc<dyn SeriesSink>>,
    closed: AtomicBool,
}

struct DemuxState {
    streams: FxHashMap<PeerId, StreamEntry>,

    /// senders with completed objects waiting to be pulled, each at most once
    ready: VecDeque<PeerId>,
}

struct StreamEntry {
    stream: ReceiveStream,
    in_ready: bool,
}

impl ReceiveStreams {
    pub fn pull() -> ReceiveStreams {
        Self::new(None)
    }

    pub fn push(sink: Arc<dyn SeriesSink>) -> ReceiveStreams {
        Self::new(Some(sink))
    }

    fn new(sink: Option<Arc<dyn SeriesSink>>) -> ReceiveStreams {
        ReceiveStreams {
            state: Mutex::new(DemuxState {
                streams: FxHashMap::default(),
                ready: VecDeque::new(),
            }),
            readable: Notify::new(),
            sink,
            closed: AtomicBool::new(false),
        }
    }

    /// Route one fragment to its sender's stream, creating the stream on first contact.
    pub fn on_fragment(&self, packet: Packet) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let sender = packet.sender;
        let mut finished = Vec::new();
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let entry = state.streams.entry(sender)
                .or_insert_with(|| StreamEntry {
                    stream: ReceiveStream::new(sender),
                    in_ready: false,
                });

            if !entry.stream.on_fragment(packet) {
                return;
            }

            match &self.sink {
                Some(_) => {
                    // push mode: take the results out of the lock, deliver below
                    while let Some(result) = entry.stream.pop_completed() {
                        finished.push(result);
                    }
                }
                None => {
                    if !entry.in_ready {
                        entry.in_ready = true;
                        state.ready.push_back(sender);
                    }
                }
            }
        }

        if let Some(sink) = &self.sink {
            for result in finished {
                sink.on_series(sender, result);
            }
        }
        else {
            self.readable.notify_one();
        }
    }

    /// Pull mode: wait for the next completed object (or broken series), rotating fairly over
    ///  all senders that have something ready. `None` means closed.
    ///
    /// Intended for a single consumer; with several concurrent callers each object still goes
    ///  to exactly one of them.
    pub async fn next_completed(&self) -> Option<(PeerId, Result<Bytes, ReassemblyError>)> {
        loop {
            {
                let mut guard = self.state.lock().unwrap();
                let state = &mut *guard;
                while let Some(sender) = state.ready.pop_front() {
                    let entry = state.streams.get_mut(&sender)
                        .unwrap(); // only senders with an entry are ever put into `ready`

                    let item = entry.stream.pop_completed();
                    if entry.stream.has_completed() {
                        // more waiting: re-queue at the back so other senders get their turn
                        state.ready.push_back(sender);
                    }
                    else {
                        entry.in_ready = false;
                    }

                    if let Some(item) = item {
                        if !state.ready.is_empty() {
                            // pass the wakeup on in case another consumer is waiting
                            self.readable.notify_one();
                        }
                        return Some((sender, item));
                    }
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.readable.notified().await;

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
        }
    }

    /// Stop delivery and wake all pull-mode waiters. Partially reassembled series and
    ///  completed objects nobody pulled yet are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut state = self.state.lock().unwrap();
            state.streams.clear();
            state.ready.clear();
        }
        self.readable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::BufMut;
    use tokio::time::timeout;

    use crate::packet_pool::PacketPool;

    fn fragment(pool: &PacketPool, sender: u16, series_id: u32, fragment: u32, is_last: bool, payload: &[u8]) -> Packet {
        let mut buf = pool.acquire(payload.len());
        buf.put_slice(payload);

        Packet {
            sender: PeerId::from_raw(sender),
            series_id,
            fragment,
            is_last,
            destinations: Vec::new(),
            payload: buf,
            originated_locally: false,
        }
    }

    #[tokio::test]
    async fn test_pull_single_sender() {
        let pool = PacketPool::new(64, 4);
        let demux = ReceiveStreams::pull();

        demux.on_fragment(fragment(&pool, 1, 1, 0, false, b"he"));
        demux.on_fragment(fragment(&pool, 1, 1, 1, true, b"llo"));

        let (sender, result) = demux.next_completed().await.unwrap();
        assert_eq!(sender, PeerId::from_raw(1));
        assert_eq!(result, Ok(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_pull_alternates_between_ready_senders() {
        let pool = PacketPool::new(64, 4);
        let demux = ReceiveStreams::pull();

        // sender 1 has two objects ready, sender 2 has one
        demux.on_fragment(fragment(&pool, 1, 1, 0, true, b"1a"));
        demux.on_fragment(fragment(&pool, 1, 2, 0, true, b"1b"));
        demux.on_fragment(fragment(&pool, 2, 1, 0, true, b"2a"));

        let mut order = Vec::new();
        for _ in 0..3 {
            let (sender, result) = demux.next_completed().await.unwrap();
            order.push((sender.to_raw(), result.unwrap()));
        }

        assert_eq!(order, vec![
            (1, Bytes::from_static(b"1a")),
            (2, Bytes::from_static(b"2a")),
            (1, Bytes::from_static(b"1b")),
        ]);
    }

    #[tokio::test]
    async fn test_pull_waits_for_completion() {
        let pool = PacketPool::new(64, 4);
        let demux = Arc::new(ReceiveStreams::pull());

        let waiter = {
            let demux = demux.clone();
            tokio::spawn(async move {
                demux.next_completed().await
            })
        };

        demux.on_fragment(fragment(&pool, 1, 1, 0, false, b"part"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished()); // incomplete series must not wake the waiter

        demux.on_fragment(fragment(&pool, 1, 1, 1, true, b"ial"));
        let (_, result) = waiter.await.unwrap().unwrap();
        assert_eq!(result, Ok(Bytes::from_static(b"partial")));
    }

    #[tokio::test]
    async fn test_pull_surfaces_reassembly_errors() {
        let pool = PacketPool::new(64, 4);
        let demux = ReceiveStreams::pull();

        demux.on_fragment(fragment(&pool, 1, 1, 0, false, b"x"));
        demux.on_fragment(fragment(&pool, 1, 1, 5, false, b"y")); // gap

        let (_, result) = demux.next_completed().await.unwrap();
        let error = result.unwrap_err();
        assert_eq!(error.expected_fragment, 1);
        assert_eq!(error.got_fragment, 5);
    }

    #[tokio::test]
    async fn test_close_wakes_pull_waiters() {
        let demux = Arc::new(ReceiveStreams::pull());

        let waiter = {
            let demux = demux.clone();
            tokio::spawn(async move {
                demux.next_completed().await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        demux.close();

        assert_eq!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap(), None);
        assert_eq!(demux.next_completed().await, None);
    }

    #[tokio::test]
    async fn test_close_discards_unconsumed_completed_objects() {
        let pool = PacketPool::new(64, 4);
        let demux = ReceiveStreams::pull();

        demux.on_fragment(fragment(&pool, 1, 1, 0, true, b"unread"));
        demux.close();

        assert_eq!(demux.next_completed().await, None);
    }

    #[tokio::test]
    async fn test_two_concurrent_pull_consumers() {
        let pool = PacketPool::new(64, 4);
        let demux = Arc::new(ReceiveStreams::pull());

        let consumers: Vec<_> = (0..2).map(|_| {
            let demux = demux.clone();
            tokio::spawn(async move {
                demux.next_completed().await
            })
        }).collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        demux.on_fragment(fragment(&pool, 1, 1, 0, true, b"one"));
        demux.on_fragment(fragment(&pool, 2, 1, 0, true, b"two"));

        let mut received = Vec::new();
        for consumer in consumers {
            let (_, result) = timeout(Duration::from_secs(5), consumer).await.unwrap().unwrap().unwrap();
            received.push(result.unwrap());
        }
        received.sort();
        assert_eq!(received, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test]
    async fn test_push_delivers_immediately() {
        let pool = PacketPool::new(64, 4);

        let mut sink = MockSeriesSink::new();
        sink.expect_on_series()
            .withf(|sender, result| {
                *sender == PeerId::from_raw(1) && *result == Ok(Bytes::from_static(b"pushed"))
            })
            .times(1)
            .returning(|_, _| ());

        let demux = ReceiveStreams::push(Arc::new(sink));
        demux.on_fragment(fragment(&pool, 1, 1, 0, false, b"pus"));
        demux.on_fragment(fragment(&pool, 1, 1, 1, true, b"hed"));
    }

    #[tokio::test]
    async fn test_fragments_after_close_are_dropped() {
        let pool = PacketPool::new(64, 4);

        let mut sink = MockSeriesSink::new();
        sink.expect_on_series().times(0);

        let demux = ReceiveStreams::push(Arc::new(sink));
        demux.close();
        demux.on_fragment(fragment(&pool, 1, 1, 0, true, b"late"));
    }
}
