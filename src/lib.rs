//! A peer-to-peer message transport over UDP datagrams.
//!
//! Each node in a mesh broadcasts opaque byte payloads to every peer it
//! knows, either *reliable* (delivered at least once to every listed target,
//! in broadcast order, retransmitted until acknowledged) or *unreliable*
//! (sent once per target, best effort). A node can deliver on behalf of
//! peers it cannot reach directly: a neighbour marked as a forwarder relays
//! frames onwards, with acknowledgements travelling the reverse path.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each link is one UDP socket pairing to one neighbour; a node holds
//!     one [`Transport`](transport::Transport) per neighbour
//!   * nodes are identified by opaque 128-bit UUIDs, not by their addresses
//! * The abstraction is broadcasting *messages* (defined-length chunks of
//!   data as opposed to streams of bytes)
//! * Small messages are combined into a single datagram; a circular cursor
//!   rotates through the queue so an early overflow cannot starve anyone
//! * Reliable and unreliable traffic share one sequence-number space per
//!   sender; the receive side recognises duplicates through a 32-slot
//!   sliding window of acknowledged sequence numbers ([`ack_set::AckSet`])
//!   which doubles as the acknowledgement that piggy-backs on datagrams
//!   flowing the other way
//! * A message headed for several peers is encoded once and shared by
//!   reference between the per-link queues; its bookkeeping lives in one
//!   registry ([`outbound_messages::OutboundMessages`]) and is dropped when
//!   the last queue lets go
//! * No congestion control, no flow windowing, no fragmentation: a payload
//!   must fit the configured datagram size
//! * No encryption and no authenticated identity - this transport is meant
//!   for closed meshes where both are layered elsewhere
//!
//! ## Wire format
//!
//! See [`frame`] for the datagram layout. There is no datagram-level header
//! beyond a frame count, and no checksum - UDP provides one.
//!
//! ## Concurrency model
//!
//! Everything runs cooperatively on the embedding runtime: per-link pump and
//! receive tasks submit non-blocking socket I/O, and user callbacks run to
//! completion. Broadcast and flush may be called from inside a receive
//! callback - they only enqueue work.

pub mod ack_set;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod encoder;
pub mod frame;
pub mod message;
pub mod outbound_messages;
mod safe_converter;
pub mod sequence_number;
pub mod socket;
pub mod transmit_queue;
pub mod transport;

pub use crate::config::TransportConfig;
pub use crate::core::{Core, MessageHandler, TransportHandle};
pub use crate::message::UnreliableId;
pub use crate::sequence_number::SequenceNumber;
pub use crate::socket::DatagramSocket;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
