use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::encoder::DatagramEncoder;
use crate::frame::{AckBlock, FRAME_COUNT_LEN};
use crate::outbound_messages::OutboundMessages;
use crate::socket::DatagramSocket;
use crate::transmit_queue::TransmitQueue;

/// The per-link state: the transmit queue feeding one neighbour, plus the
/// acknowledgements waiting to piggy-back on the next datagram out.
///
/// The socket pump that drains this state runs as a separate task (see
/// [`send_pump`]); it is woken through `wake` whenever messages or
/// acknowledgements are enqueued.
pub struct Transport {
    remote: Uuid,
    queue: TransmitQueue,
    pending_acks: Mutex<VecDeque<AckBlock>>,
    wake: Notify,
}

impl Transport {
    pub fn new(remote: Uuid, outbound: Arc<OutboundMessages>) -> Transport {
        let queue = TransmitQueue::new(outbound);
        queue.add_target(remote);

        Transport {
            remote,
            queue,
            pending_acks: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        }
    }

    pub fn remote(&self) -> Uuid {
        self.remote
    }

    pub fn queue(&self) -> &TransmitQueue {
        &self.queue
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Enqueues an acknowledgement for the next datagram on this link. A
    /// newer window for the same (acker, source) pairing supersedes the one
    /// still waiting - the window is cumulative, so nothing is lost.
    pub fn push_ack(&self, block: AckBlock) {
        let mut pending = self.lock_acks();
        if let Some(existing) = pending.iter_mut()
            .find(|b| b.acker == block.acker && b.source == block.source)
        {
            *existing = block;
        } else {
            pending.push_back(block);
        }
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.lock_acks().is_empty()
    }

    /// Nothing left to do on this link: no sendable messages, no
    /// acknowledgements waiting.
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_quiescent() && !self.has_pending_acks()
    }

    /// Packs the next datagram for this link: as many message frames as fit,
    /// then as many pending acknowledgements as fit. Returns `None` if there
    /// is nothing to send.
    fn build_datagram(&self, datagram_size: usize) -> Option<(BytesMut, u16)> {
        let mut encoder = DatagramEncoder::new(datagram_size);
        encoder.buf().put_u16(0); // frame count, patched below

        let frame_count = self.queue.encode_few(&mut encoder);

        let mut ack_count = 0;
        {
            let mut pending = self.lock_acks();
            while let Some(block) = pending.front() {
                if encoder.remaining() < AckBlock::SERIALIZED_LEN {
                    break;
                }
                block.ser(encoder.buf());
                pending.pop_front();
                ack_count += 1;
            }
        }

        if frame_count == 0 && ack_count == 0 {
            return None;
        }

        let mut buf = encoder.finish();
        buf[0..FRAME_COUNT_LEN].copy_from_slice(&frame_count.to_be_bytes());

        trace!("datagram to {}: {} frames, {} ack blocks, {} bytes",
            self.remote, frame_count, ack_count, buf.len());
        Some((buf, frame_count))
    }

    fn lock_acks(&self) -> std::sync::MutexGuard<'_, VecDeque<AckBlock>> {
        self.pending_acks.lock().expect("pending ack lock poisoned")
    }
}

/// Drains a link's transmit queue and pending acknowledgements into
/// datagrams, for as long as the link lives.
///
/// Each wakeup covers the whole queue once (several datagrams if necessary),
/// then either parks until woken again or - while reliable messages are
/// still awaiting acknowledgement - rearms the retransmit timer.
pub(crate) async fn send_pump(
    transport: Arc<Transport>,
    socket: Arc<dyn DatagramSocket>,
    config: Arc<TransportConfig>,
    flush_notify: Arc<Notify>,
) {
    loop {
        let notified = transport.wake.notified();

        // one burst covers the ring once (several datagrams if necessary)
        // plus everything in the ack queue, then the pump parks again
        let mut remaining = transport.queue.pending_message_count();
        loop {
            let Some((buf, frame_count)) = transport.build_datagram(config.datagram_size) else {
                break;
            };

            if !send_datagram(&transport, socket.as_ref(), &buf).await {
                flush_notify.notify_waiters();
                return;
            }

            remaining = remaining.saturating_sub(frame_count as usize);
            if remaining == 0 && !transport.has_pending_acks() {
                break;
            }
        }

        flush_notify.notify_waiters();

        if transport.queue.has_reliable_pending() {
            //TODO exponential backoff for links that stay silent across many intervals
            tokio::select! {
                _ = notified => {},
                _ = time::sleep(config.retransmit_interval) => {
                    trace!("retransmit timer fired for link to {}", transport.remote);
                },
            }
        } else {
            notified.await;
        }
    }
}

/// Returns false if the link is dead and the pump should stop.
async fn send_datagram(transport: &Transport, socket: &dyn DatagramSocket, buf: &[u8]) -> bool {
    loop {
        match socket.send(buf).await {
            Ok(()) => return true,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                debug!("transient send error on link to {}: {} - retrying", transport.remote, e);
            }
            Err(e) => {
                error!("fatal send error on link to {}: {} - tearing the link down", transport.remote, e);
                transport.queue.clear();
                transport.lock_acks().clear();
                return false;
            }
        }
    }
}
