use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::dispatcher::{Acceptance, InboundDispatcher};
use crate::frame::{parse_datagram, AckBlock, Frame};
use crate::message::{Message, MessageKind, UnreliableId};
use crate::outbound_messages::OutboundMessages;
use crate::socket::DatagramSocket;
use crate::transport::{send_pump, Transport};

/// Receives payloads delivered to this node. Callbacks run to completion on
/// the event loop; calling back into [`Core::broadcast_reliable`],
/// [`Core::broadcast_unreliable`] or [`Core::flush`] from inside one is
/// legal - they only enqueue work.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, source: Uuid, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(Uuid, &[u8]) + Send + Sync + 'static,
{
    fn on_message(&self, source: Uuid, payload: &[u8]) {
        self(source, payload)
    }
}

/// The per-node façade where all parts of the transport come together: it
/// owns the outbound registry and one [`Transport`] per directly-connected
/// neighbour, routes received frames to the embedder's callback and onwards
/// to forwarded targets, and answers `flush`.
///
/// Cloning yields another handle onto the same node.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

/// Handle to one installed link, used to maintain its routing table.
#[derive(Clone)]
pub struct TransportHandle {
    transport: Arc<Transport>,
}

impl TransportHandle {
    pub fn remote(&self) -> Uuid {
        self.transport.remote()
    }

    /// Marks `id` as reachable through this link, so broadcasts get forwarded
    /// to it by the neighbour.
    pub fn add_target(&self, id: Uuid) {
        self.transport.queue().add_target(id);
    }
}

struct CoreInner {
    node_id: Uuid,
    config: Arc<TransportConfig>,
    outbound: Arc<OutboundMessages>,
    dispatcher: InboundDispatcher,
    handler: Mutex<Arc<dyn MessageHandler>>,
    transports: Mutex<Vec<Arc<Transport>>>,
    flush_notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    pub fn new(
        node_id: Uuid,
        handler: Arc<dyn MessageHandler>,
        config: Arc<TransportConfig>,
    ) -> anyhow::Result<Core> {
        config.validate()?;

        Ok(Core {
            inner: Arc::new(CoreInner {
                node_id,
                config,
                outbound: Arc::new(OutboundMessages::new(node_id)),
                dispatcher: InboundDispatcher::new(),
                handler: Mutex::new(handler),
                transports: Mutex::new(Vec::new()),
                flush_notify: Arc::new(Notify::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    /// Replaces the receive callback. Deliveries dispatched after this call
    /// land on the new handler.
    pub fn set_on_recv(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.handler.lock().expect("handler lock poisoned") = handler;
    }

    /// Installs a link to the neighbour `remote`: binds the socket pairing to
    /// its endpoint and starts the link's send pump and receive loop.
    pub async fn add_transport(
        &self,
        remote: Uuid,
        socket: UdpSocket,
        remote_endpoint: SocketAddr,
    ) -> anyhow::Result<TransportHandle> {
        socket.connect(remote_endpoint).await?;
        Ok(self.add_transport_with(remote, Arc::new(socket)))
    }

    /// Like [`add_transport`](Self::add_transport), but over an arbitrary
    /// datagram socket (e.g. one with fault injection in tests).
    pub fn add_transport_with(
        &self,
        remote: Uuid,
        socket: Arc<dyn DatagramSocket>,
    ) -> TransportHandle {
        debug!("{}: installing link to {}", self.inner.node_id, remote);

        let transport = Arc::new(Transport::new(remote, self.inner.outbound.clone()));
        self.inner.lock_transports().push(transport.clone());

        let pump = tokio::spawn(send_pump(
            transport.clone(),
            socket.clone(),
            self.inner.config.clone(),
            self.inner.flush_notify.clone(),
        ));
        let recv = tokio::spawn(recv_loop(
            Arc::downgrade(&self.inner),
            transport.clone(),
            socket,
            self.inner.config.datagram_size,
        ));
        self.inner.lock_tasks().extend([pump, recv]);

        TransportHandle { transport }
    }

    /// Broadcasts `payload` to every known peer, retransmitting until each
    /// one has acknowledged it. Delivery is in broadcast order per receiver.
    pub fn broadcast_reliable(&self, payload: &[u8]) -> anyhow::Result<()> {
        let inner = &self.inner;
        let transports = inner.transports_snapshot();

        let Some(targets) = inner.broadcast_targets(&transports, payload)? else {
            return Ok(());
        };

        let message = inner.outbound.add_reliable(payload, targets);
        trace!("{}: broadcasting reliable message {}", inner.node_id, message.sequence_number());
        inner.enqueue_message(&transports, &message, None);
        Ok(())
    }

    /// Broadcasts `payload` best-effort: sent once per target, no
    /// retransmission, no ordering promise. Broadcasts repeated under the
    /// same `id` coalesce while the first is still in flight.
    pub fn broadcast_unreliable(&self, id: UnreliableId, payload: &[u8]) -> anyhow::Result<()> {
        let inner = &self.inner;
        let transports = inner.transports_snapshot();

        let Some(targets) = inner.broadcast_targets(&transports, payload)? else {
            return Ok(());
        };

        let (message, created) = inner.outbound.add_unreliable(id, payload, targets);
        if !created {
            // already queued everywhere it needs to be
            return Ok(());
        }
        trace!("{}: broadcasting unreliable message {}", inner.node_id, message.sequence_number());
        inner.enqueue_message(&transports, &message, None);
        Ok(())
    }

    /// Resolves once all links are quiescent: every transmit queue is empty
    /// or holds only messages with no reachable targets left, and every
    /// pending acknowledgement has been sent.
    ///
    /// For reliable delivery this means every target has acknowledged; a
    /// caller that needs "delivered to all targets" must also flush the
    /// receiving side.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.flush_notify.notified();
            tokio::pin!(notified);
            // register before checking, so a notification between the check
            // and the await cannot be missed
            notified.as_mut().enable();
            if self.inner.is_quiescent() {
                return;
            }
            notified.await;
        }
    }
}

impl CoreInner {
    /// The targets of a broadcast: every node reachable through any link.
    /// `None` (with a debug log) if there are no peers to send to.
    fn broadcast_targets(
        &self,
        transports: &[Arc<Transport>],
        payload: &[u8],
    ) -> anyhow::Result<Option<BTreeSet<Uuid>>> {
        let mut targets = BTreeSet::new();
        for transport in transports {
            targets.extend(transport.queue().remote_targets());
        }
        targets.remove(&self.node_id);

        if targets.is_empty() {
            debug!("{}: broadcast with no known peers - dropping", self.node_id);
            return Ok(None);
        }

        let max_len = self.config.max_payload_len(targets.len());
        if payload.len() > max_len {
            anyhow::bail!(
                "payload of {} bytes exceeds the {} byte maximum for a single datagram to {} targets",
                payload.len(), max_len, targets.len(),
            );
        }

        Ok(Some(targets))
    }

    /// Shares `message` into every queue that can reach one of its targets
    /// and wakes the corresponding pumps.
    fn enqueue_message(
        &self,
        transports: &[Arc<Transport>],
        message: &Arc<Message>,
        exclude: Option<Uuid>,
    ) {
        for transport in transports {
            if Some(transport.remote()) == exclude {
                continue;
            }
            if message.has_any_target_in(&transport.queue().remote_targets()) {
                transport.queue().insert_message(message.clone());
                transport.wake();
            }
        }
    }

    /// One received datagram from the link to `arrival`'s neighbour.
    fn on_datagram(&self, arrival: &Arc<Transport>, datagram: Bytes) {
        let (frames, ack_blocks) = parse_datagram(datagram);

        for frame in frames {
            self.on_frame(arrival, frame);
        }

        // our own acknowledgements piggy-back on the next datagram towards
        // each source, directly or along the reverse path
        for block in self.dispatcher.take_dirty_acks(self.node_id) {
            self.route_ack(block, None);
        }

        let mut any_target_dropped = false;
        for block in ack_blocks {
            any_target_dropped |= self.on_ack_block(arrival, block);
        }
        if any_target_dropped {
            // give every queue a chance to prune messages that are done
            for transport in self.transports_snapshot() {
                transport.wake();
            }
        }

        self.flush_notify.notify_waiters();
    }

    fn on_frame(&self, arrival: &Arc<Transport>, frame: Frame) {
        if frame.source == self.node_id {
            // a stale forward of one of our own broadcasts made it back
            return;
        }

        let sn = frame.header.sequence_number;
        match self.dispatcher.accept(frame.source, sn, frame.header.kind) {
            Acceptance::Rejected => {}
            Acceptance::Duplicate => {
                // not delivered again - but a reliable frame that still lists
                // other targets may mean our earlier forward (or the
                // acknowledgement it produced) got lost, so keep relaying
                if frame.header.kind == MessageKind::Reliable {
                    self.forward(arrival, &frame);
                }
            }
            Acceptance::Accepted => {
                self.forward(arrival, &frame);

                if frame.targets.contains(&self.node_id) {
                    trace!("{}: delivering message {} from {}", self.node_id, sn, frame.source);
                    let payload = frame.payload();
                    let handler = self.handler.lock().expect("handler lock poisoned").clone();
                    // the handler lock is released again: the callback may broadcast
                    handler.on_message(frame.source, &payload);
                }
            }
        }
    }

    /// Re-enqueues a frame for the listed targets other than ourselves. The
    /// forwarded message keeps its original source and sequence number.
    fn forward(&self, arrival: &Arc<Transport>, frame: &Frame) {
        let mut forward_targets: BTreeSet<Uuid> = frame.targets.iter().cloned().collect();
        forward_targets.remove(&self.node_id);
        if forward_targets.is_empty() {
            return;
        }

        let (message, created) = self.outbound.add_forwarded(
            frame.source,
            frame.header.sequence_number,
            frame.header.kind,
            frame.inner.clone(),
            forward_targets,
        );
        if !created {
            // the live copy is already queued on the right links
            return;
        }

        trace!("{}: forwarding message {} from {}", self.node_id, message.sequence_number(), frame.source);
        self.enqueue_message(&self.transports_snapshot(), &message, Some(arrival.remote()));
    }

    /// Returns true if the acknowledgement retired a target somewhere.
    fn on_ack_block(&self, arrival: &Arc<Transport>, block: AckBlock) -> bool {
        trace!("{}: ack from {} for {} up to {:?}",
            self.node_id, block.acker, block.source, block.acks.highest());

        // retires targets on our own and forwarded copies alike; acks for
        // unknown messages fall through silently
        let any_target_dropped = self.outbound.on_ack_set(block.acker, block.source, &block.acks);

        if block.source != self.node_id {
            // not ours: relay towards the source along the reverse path
            self.route_ack(block, Some(arrival.remote()));
        }
        any_target_dropped
    }

    fn route_ack(&self, block: AckBlock, exclude: Option<Uuid>) {
        let mut routed = false;
        for transport in self.transports_snapshot() {
            if Some(transport.remote()) == exclude {
                continue;
            }
            if transport.queue().routes_to(&block.source) {
                transport.push_ack(block.clone());
                transport.wake();
                routed = true;
            }
        }
        if !routed {
            debug!("{}: no route for acknowledgement towards {}", self.node_id, block.source);
        }
    }

    fn is_quiescent(&self) -> bool {
        self.transports_snapshot().iter().all(|t| t.is_quiescent())
    }

    fn transports_snapshot(&self) -> Vec<Arc<Transport>> {
        self.lock_transports().clone()
    }

    fn lock_transports(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Transport>>> {
        self.transports.lock().expect("transport list lock poisoned")
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().expect("task list lock poisoned")
    }
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        // in-flight sends may complete, their completions are ignored
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

/// Reads datagrams off one link's socket for as long as the link and its node
/// live.
pub(crate) async fn recv_loop(
    core: Weak<CoreInner>,
    transport: Arc<Transport>,
    socket: Arc<dyn DatagramSocket>,
    datagram_size: usize,
) {
    let mut buf = vec![0u8; datagram_size + 1];

    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                if len > datagram_size {
                    warn!("received packet exceeds configured datagram size - skipping");
                    continue;
                }
                let Some(core) = core.upgrade() else {
                    return;
                };
                core.on_datagram(&transport, Bytes::copy_from_slice(&buf[..len]));
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                debug!("transient receive error on link to {}: {}", transport.remote(), e);
            }
            Err(e) => {
                error!("fatal receive error on link to {}: {} - stopping the receive loop",
                    transport.remote(), e);
                return;
            }
        }
    }
}
