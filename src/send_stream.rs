use std::sync::Arc;

use anyhow::bail;
use bytes::BufMut;

use crate::engine::ChainMulticast;
use crate::packet::LAST_FRAGMENT;
use crate::packet_pool::PacketPool;

/// Slices serialized objects into fragment series for the forwarding engine.
///
/// Each object becomes one series: fragments numbered from 0, the final one flagged, all
///  carrying the same fresh series id. Receivers use the numbering to detect loss and the
///  series id to tell objects apart.
pub struct FragmentWriter {
    engine: Arc<ChainMulticast>,
    pool: PacketPool,
    fragment_size: usize,
    next_series_id: u32,
    bytes_written: u64,
}

impl FragmentWriter {
    pub fn new(engine: Arc<ChainMulticast>) -> FragmentWriter {
        let pool = engine.pool();
        let fragment_size = pool.buf_size();

        FragmentWriter {
            engine,
            pool,
            fragment_size,
            next_series_id: 1,
            bytes_written: 0,
        }
    }

    /// Send one object's bytes as a complete fragment series, returning the series id so the
    ///  caller can correlate the completion notification.
    pub async fn write_series(&mut self, data: &[u8]) -> anyhow::Result<u32> {
        let series_id = self.next_series_id;
        self.next_series_id = self.next_series_id.wrapping_add(1);

        let num_fragments = if data.is_empty() { 1 } else { data.len().div_ceil(self.fragment_size) };
        if num_fragments as u64 > LAST_FRAGMENT as u64 {
            bail!("object of {} bytes needs more fragments than the numbering can express", data.len());
        }

        if data.is_empty() {
            // an empty object still needs its (single, final) fragment on the wire
            let payload = self.pool.acquire(0);
            self.engine.send(series_id, 0, true, payload).await?;
        }
        else {
            for (fragment, chunk) in data.chunks(self.fragment_size).enumerate() {
                let mut payload = self.pool.acquire(chunk.len());
                payload.put_slice(chunk);

                let is_last = fragment == num_fragments - 1;
                self.engine.send(series_id, fragment as u32, is_last, payload).await?;
            }
        }

        self.bytes_written += data.len() as u64;
        Ok(series_id)
    }

    /// Total payload bytes handed to [Self::write_series] so far, optionally resetting.
    pub fn bytes_written(&mut self, reset: bool) -> u64 {
        let result = self.bytes_written;
        if reset {
            self.bytes_written = 0;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::anyhow;
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use tokio::sync::mpsc;

    use crate::config::LrmcConfig;
    use crate::packet::{self, WireMessage};
    use crate::peer::PeerIdentity;
    use crate::transport::{Connection, MockConnection, MockFragmentReceiver, MockTransport};

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::new(name, "site-a")
    }

    /// engine with a tiny fragment size whose transport records every frame sent
    async fn capturing_writer(fragment_size: usize) -> (FragmentWriter, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut transport = MockTransport::new();
        transport.expect_connect()
            .with(eq(peer("d1")), always())
            .returning(move |_, _| {
                let tx = tx.clone();
                let mut conn = MockConnection::new();
                conn.expect_send_packet()
                    .returning(move |data| {
                        tx.send(data.to_vec()).map_err(|e| anyhow!(e))?;
                        Ok(())
                    });
                conn.expect_close().returning(|| ());
                let conn: Arc<dyn Connection> = Arc::new(conn);
                Ok(conn)
            });

        let config = LrmcConfig {
            fragment_payload_size: fragment_size,
            ..LrmcConfig::new()
        };

        let engine = ChainMulticast::new(config, peer("n0"), Arc::new(transport), Arc::new(MockFragmentReceiver::new())).unwrap();
        engine.add_peer(peer("n0")).await;
        engine.add_peer(peer("d1")).await;
        engine.set_destinations(&[peer("d1")]).await;

        (FragmentWriter::new(engine), rx)
    }

    fn parse_fragment(wire: &[u8], pool: &PacketPool) -> (u32, u32, bool, Vec<u8>) {
        match packet::deser(wire, pool).unwrap() {
            WireMessage::Data(p) => (p.series_id, p.fragment, p.is_last, p.payload.as_ref().to_vec()),
            _ => panic!("expected a data packet"),
        }
    }

    #[rstest]
    #[case::empty(0)]
    #[case::below_fragment_size(60)]
    #[case::exactly_fragment_size(64)]
    fn test_single_fragment_series(#[case] data_len: usize) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (mut writer, mut rx) = capturing_writer(64).await;
            let pool = PacketPool::new(64, 4);

            let data = vec![7u8; data_len];
            let series_id = writer.write_series(&data).await.unwrap();

            let (series, fragment, is_last, payload) = parse_fragment(&rx.recv().await.unwrap(), &pool);
            assert_eq!(series, series_id);
            assert_eq!(fragment, 0);
            assert!(is_last);
            assert_eq!(payload, data);

            assert!(rx.try_recv().is_err());
        });
    }

    #[rstest]
    #[case::one_byte_over(65, 64, 2)]
    #[case::multiple(200, 64, 4)]
    #[case::exact_multiple(192, 64, 3)]
    fn test_slicing(#[case] data_len: usize, #[case] fragment_size: usize, #[case] expected_fragments: usize) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (mut writer, mut rx) = capturing_writer(fragment_size).await;
            let pool = PacketPool::new(fragment_size, 4);

            let data: Vec<u8> = (0..data_len).map(|i| i as u8).collect();
            let series_id = writer.write_series(&data).await.unwrap();

            let mut reassembled = Vec::new();
            for expected_fragment in 0..expected_fragments {
                let (series, fragment, is_last, payload) = parse_fragment(&rx.recv().await.unwrap(), &pool);
                assert_eq!(series, series_id);
                assert_eq!(fragment, expected_fragment as u32);
                assert_eq!(is_last, expected_fragment == expected_fragments - 1);
                reassembled.extend_from_slice(&payload);
            }
            assert_eq!(reassembled, data);
        });
    }

    #[tokio::test]
    async fn test_series_ids_differ_between_objects() {
        let (mut writer, mut rx) = capturing_writer(64).await;
        let pool = PacketPool::new(64, 4);

        let first = writer.write_series(b"a").await.unwrap();
        let second = writer.write_series(b"b").await.unwrap();
        assert_ne!(first, second);

        let (series, _, _, _) = parse_fragment(&rx.recv().await.unwrap(), &pool);
        assert_eq!(series, first);
        let (series, _, _, _) = parse_fragment(&rx.recv().await.unwrap(), &pool);
        assert_eq!(series, second);
    }

    #[tokio::test]
    async fn test_bytes_written_accounting() {
        let (mut writer, _rx) = capturing_writer(64).await;

        writer.write_series(&[0u8; 100]).await.unwrap();
        writer.write_series(&[0u8; 28]).await.unwrap();

        assert_eq!(writer.bytes_written(false), 128);
        assert_eq!(writer.bytes_written(true), 128);
        assert_eq!(writer.bytes_written(false), 0);
    }
}
