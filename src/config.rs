use std::time::Duration;

use anyhow::bail;

use crate::frame::{self, MessageHeader, FRAME_COUNT_LEN};

pub struct TransportConfig {
    /// This is the payload size inside UDP packets that the transport packs
    /// datagrams up to. The transport never fragments, so this size (and the
    /// implied packet size) must be supported by all network connections
    /// between nodes.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is
    /// `1500 - 20 - 8 = 1472` for IPV4. Links confined to loopback (e.g. in
    /// tests) can go much higher. Choosing this value too big causes packets
    /// to be dropped; choosing it too small wastes bandwidth.
    pub datagram_size: usize,

    /// How long a link waits for acknowledgements before re-sending the
    /// reliable messages still in its queue.
    pub retransmit_interval: Duration,
}

impl TransportConfig {
    /// IPV4 with end-to-end full Ethernet MTU, without optional headers.
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            datagram_size: 1472,
            retransmit_interval: Duration::from_millis(50),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.datagram_size < 128 {
            bail!("datagram size is too small");
        }
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be non-zero");
        }
        Ok(())
    }

    /// The largest payload that fits a single datagram when broadcast to
    /// `target_count` targets.
    pub fn max_payload_len(&self, target_count: usize) -> usize {
        self.datagram_size
            .saturating_sub(FRAME_COUNT_LEN)
            .saturating_sub(frame::frame_overhead(target_count))
            .saturating_sub(MessageHeader::SERIALIZED_LEN)
    }
}
