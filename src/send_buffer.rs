use crate::error::{Error, Result};
use std::collections::VecDeque;

/// Completion handler for a queued send.
///
/// Invoked with `Ok(())` once the buffer has been fully drained into packets
/// (the moment of transmission), or with [`Error::SendAborted`] when the
/// stream is torn down first.
pub type SendHandler = Box<dyn FnOnce(Result<()>) + Send>;

/// One application submission awaiting packetization
pub struct SendBuffer {
    data: Vec<u8>,
    offset: usize,
    handler: Option<SendHandler>,
}

impl SendBuffer {
    pub fn new(data: Vec<u8>, handler: Option<SendHandler>) -> Self {
        Self {
            data,
            offset: 0,
            handler,
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn complete(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler(Ok(()));
        }
    }

    fn cancel(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler(Err(Error::SendAborted));
        }
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Ordered queue of application submissions, drained into packet payloads.
///
/// Buffers are owned by the queue until fully drained or cancelled; each
/// buffer's completion handler runs upon full consumption.
#[derive(Default)]
pub struct SendBufferQueue {
    buffers: VecDeque<SendBuffer>,
    size: usize,
}

impl SendBufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, buf: SendBuffer) {
        self.size += buf.data.len() - buf.offset;
        self.buffers.push_back(buf);
    }

    /// Drain up to `len` bytes across buffers in FIFO order
    pub fn get(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.min(self.size));
        while out.len() < len {
            let Some(next) = self.buffers.front_mut() else {
                break;
            };
            let rem = next.remaining();
            let take = rem.len().min(len - out.len());
            out.extend_from_slice(&rem[..take]);
            next.offset += take;
            if next.remaining().is_empty() {
                let mut done = self.buffers.pop_front();
                if let Some(buf) = done.as_mut() {
                    buf.complete();
                }
            }
        }
        self.size -= out.len();
        out
    }

    /// Cancel all pending submissions with an aborted status
    pub fn clean_up(&mut self) {
        for buf in &mut self.buffers {
            buf.cancel();
        }
        self.buffers.clear();
        self.size = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Queued byte count
    pub fn size(&self) -> usize {
        self.size
    }
}
