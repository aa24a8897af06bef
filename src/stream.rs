//! Per-stream handle and state.
//!
//! A [`Stream`] is a unique, non-`Clone`-able handle: the owning side reads
//! and writes through it directly, while the connection's dispatch loop
//! talks to the same logical stream through the [`StreamShared`] half it
//! keeps alongside the handle in [`crate::mux::Slot`]. The split mirrors
//! `tokio::sync::mpsc`'s own sender/receiver asymmetry rather than wrapping
//! the whole stream in a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::frame;
use crate::mux::{MuxShared, OutboundMsg};

/// Outcome of a [`Stream::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `buf` was filled, or partially filled because `closed` fired after
    /// some bytes were already copied in.
    Ok,
    /// The stream is closed and its inbox is empty: no bytes were copied.
    Eof,
}

/// The half of a stream's state that the dispatch loop and `close()` touch.
///
/// Shared via `Arc` between the [`Stream`] handle and the multiplexer's
/// `streams` map so the dispatcher can deliver payloads and observe/trigger
/// closure without holding the channel lock across any of it.
pub(crate) struct StreamShared {
    id: u64,
    name: String,
    header: u64,
    inbox_tx: mpsc::Sender<Bytes>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    local_closed: AtomicBool,
    mux: Arc<MuxShared>,
}

impl StreamShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Deliver `payload` to the stream's inbox, respecting back-pressure.
    ///
    /// Called by the dispatch loop after releasing the channel lock. Races
    /// the bounded send against `closed` so a stream that closes while the
    /// dispatcher is stalled on it (inbox full) doesn't wedge the whole
    /// connection's inbound direction forever.
    pub(crate) async fn receive(&self, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        let mut closed_rx = self.closed_rx.clone();
        tokio::select! {
            biased;
            _ = closed_rx.changed() => {}
            res = self.inbox_tx.send(payload) => { let _ = res; }
        }
    }

    /// Fire `closed` without touching the map or the outbound channel.
    /// Used when the dispatcher itself is the one tearing down the map
    /// entry (remote `Close` frame, or multiplexer shutdown).
    pub(crate) fn force_close(&self) {
        self.local_closed.store(true, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }

    /// Local `close()`: idempotent, signals `closed`, best-effort notifies
    /// the peer, and tombstones this id in the map so a stray late frame
    /// for it cannot be mistaken for a freshly, remotely opened stream
    /// (see `DESIGN.md`, Open Question 1).
    ///
    /// The peer notification is a non-blocking `try_send`: `close()` is a
    /// synchronous call and must not itself suspend waiting for outbound
    /// capacity, so a full outbound channel simply drops the `Close` frame
    /// rather than blocking the caller.
    fn local_close(&self) {
        if self.local_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_tx.send(true);
        let _ = self.mux.outbound_tx.try_send(OutboundMsg {
            header: frame::close_header(self.id),
            payload: Bytes::new(),
        });
        self.mux.tombstone(self.id);
    }
}

/// A single multiplexed byte stream.
///
/// Obtained from [`crate::Multiplex::new_stream`]/`new_named_stream` on the
/// locally-initiating side, or handed to the `handler` passed to
/// [`crate::Multiplex::serve`] on the accepting side.
pub struct Stream {
    pub(crate) shared: Arc<StreamShared>,
    inbox_rx: mpsc::Receiver<Bytes>,
    residual: BytesMut,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, inbox_rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            shared,
            inbox_rx,
            residual: BytesMut::new(),
        }
    }

    pub(crate) fn build(
        mux: Arc<MuxShared>,
        id: u64,
        locally_initiated: bool,
        name: String,
        inbox_capacity: usize,
    ) -> (Self, Arc<StreamShared>) {
        let header = frame::data_header(id, locally_initiated);
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(StreamShared {
            id,
            name,
            header,
            inbox_tx,
            closed_tx,
            closed_rx,
            local_closed: AtomicBool::new(false),
            mux,
        });
        (Self::new(shared.clone(), inbox_rx), shared)
    }

    /// This stream's id on the wire.
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// The stream's name, defaulting to the decimal rendering of its id
    /// when no name was given (an anonymous local stream, or one opened
    /// remotely via a non-`NewStream` frame).
    pub fn name(&self) -> std::borrow::Cow<'_, str> {
        if self.shared.name.is_empty() {
            std::borrow::Cow::Owned(self.shared.id.to_string())
        } else {
            std::borrow::Cow::Borrowed(&self.shared.name)
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Copy up to `buf.len()` bytes into `buf`.
    ///
    /// Drains `residual` first, then the inbox. If a delivered payload is
    /// larger than the remaining room in `buf`, the unused suffix is kept
    /// in `residual` for the next call. Returns `(n, Eof)` only when
    /// nothing at all was copied and the stream is closed with an empty
    /// inbox; a partial fill that hits `closed` mid-read is reported as
    /// `Ok` (the following call reports `Eof`).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        let mut n = 0;

        if !self.residual.is_empty() {
            let take = self.residual.len().min(buf.len());
            buf[..take].copy_from_slice(&self.residual[..take]);
            let _ = self.residual.split_to(take);
            n += take;
        }

        while n < buf.len() {
            let next = match self.inbox_rx.try_recv() {
                Ok(payload) => Some(payload),
                Err(mpsc::error::TryRecvError::Disconnected) => None,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.is_closed() {
                        None
                    } else {
                        let mut closed_rx = self.shared.closed_rx.clone();
                        tokio::select! {
                            biased;
                            payload = self.inbox_rx.recv() => payload,
                            _ = closed_rx.changed() => {
                                // closed just fired; one more non-blocking
                                // drain before declaring EOF so nothing
                                // queued right at the boundary is lost.
                                self.inbox_rx.try_recv().ok()
                            }
                        }
                    }
                }
            };

            match next {
                Some(payload) => {
                    let take = payload.len().min(buf.len() - n);
                    buf[n..n + take].copy_from_slice(&payload[..take]);
                    n += take;
                    if take < payload.len() {
                        self.residual.extend_from_slice(&payload[take..]);
                        break;
                    }
                }
                None => break,
            }
        }

        if n == 0 && self.is_closed() && self.residual.is_empty() {
            Ok((0, ReadStatus::Eof))
        } else {
            Ok((n, ReadStatus::Ok))
        }
    }

    /// Send `buf` as a single frame. The stream never fragments a write;
    /// large buffers become large frames.
    ///
    /// Suspends until the serializer has room for this frame on the
    /// connection's outbound channel, or until `closed` fires -- whichever
    /// comes first. A connection whose serializer is stalled (peer not
    /// draining the transport) therefore backs up into every writer on it.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let msg = OutboundMsg {
            header: self.shared.header,
            payload: Bytes::copy_from_slice(buf),
        };
        let mut closed_rx = self.shared.closed_rx.clone();
        tokio::select! {
            biased;
            _ = closed_rx.changed() => Err(Error::StreamClosed),
            res = self.shared.mux.outbound_tx.send(msg) => {
                res.map_err(|_| Error::MultiplexClosed)?;
                Ok(buf.len())
            }
        }
    }

    /// Idempotent close: signals `closed`, best-effort notifies the peer
    /// with a `Close` frame, and tombstones the id in the connection map.
    pub fn close(&self) -> Result<()> {
        self.shared.local_close();
        Ok(())
    }
}
