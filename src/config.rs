use std::time::Duration;

use anyhow::bail;

/// Configuration for one multicast instance.
pub struct LrmcConfig {
    /// Payload capacity of one fragment. Every multicast is sliced into packets of (at most)
    ///  this size, and the packet pool hands out buffers of exactly this capacity on the fast
    ///  path. Choosing it larger trades per-packet overhead against memory held in partially
    ///  filled reassembly buffers.
    pub fragment_payload_size: usize,

    /// The number of fragment buffers retained in the pool's free list - buffers returned in
    ///  excess of this are dropped, which bounds worst-case memory under bursty release patterns.
    pub max_pool_size: usize,

    /// Capacity of the relay queue between the receive upcall and the forwarding task. Small by
    ///  design: a large queue masks backpressure problems and increases shutdown drain time.
    pub relay_queue_capacity: usize,

    /// How long a suspected-dead peer stays short-circuited as unreachable before exactly one
    ///  reconnect is attempted again. Without this, a single large multicast - fragmented into
    ///  many packets that all carry the same route - would retry the dead hop once per fragment.
    pub zombie_cooldown: Duration,

    /// Upper bound for name lookup and connection setup to one peer.
    pub connect_timeout: Duration,

    /// How long `done()` waits for the relay task to drain before proceeding anyway.
    pub shutdown_join_timeout: Duration,

    /// Whether destination lists are reordered to visit topologically close peers early.
    pub cluster_aware_sorting: bool,
}

impl LrmcConfig {
    pub fn new() -> LrmcConfig {
        LrmcConfig {
            fragment_payload_size: 8 * 1024,
            max_pool_size: 256,
            relay_queue_capacity: 64,
            zombie_cooldown: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            shutdown_join_timeout: Duration::from_secs(1),
            cluster_aware_sorting: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fragment_payload_size < 64 {
            bail!("fragment payload size is too small");
        }
        if self.relay_queue_capacity == 0 {
            bail!("relay queue capacity must be at least 1");
        }
        Ok(())
    }
}

impl Default for LrmcConfig {
    fn default() -> Self {
        LrmcConfig::new()
    }
}
