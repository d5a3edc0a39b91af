use bytes::BytesMut;

/// A write buffer with a hard size budget (one datagram) and cheap rollback.
///
/// Writers append speculatively and then check [`fits`](Self::fits); on
/// overflow they roll back to the last checkpoint and defer whatever did not
/// fit to the next datagram.
pub struct DatagramEncoder {
    buf: BytesMut,
    limit: usize,
}

impl DatagramEncoder {
    pub fn new(limit: usize) -> DatagramEncoder {
        DatagramEncoder {
            buf: BytesMut::with_capacity(limit),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    pub fn fits(&self) -> bool {
        self.buf.len() <= self.limit
    }

    pub fn checkpoint(&self) -> usize {
        self.buf.len()
    }

    pub fn rollback_to(&mut self, checkpoint: usize) {
        self.buf.truncate(checkpoint);
    }

    pub fn buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn finish(self) -> BytesMut {
        debug_assert!(self.fits());
        self.buf
    }
}
