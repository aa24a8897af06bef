//! Connection-level multiplexer: identifier allocation, the outbound
//! serializer task, and the inbound dispatch loop.
//!
//! A single `parking_lot::Mutex<HashMap<u64, Slot>>` is the one piece of
//! state every task touches. It is locked only for the lookup/insert/remove
//! statement itself -- never across a send, a transport read, or a handler
//! invocation -- so a slow stream handler or a full inbox can stall that
//! stream's delivery without stalling anyone else's bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::frame::{self, Tag};
use crate::stream::{Stream, StreamShared};

/// Tunables for a [`Multiplex`]. `MuxConfig::default()` matches the
/// protocol's own defaults.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Capacity of each stream's inbox. A stream whose consumer never
    /// reads eventually stalls the dispatch loop's delivery into it,
    /// which in turn stalls the whole connection's inbound direction.
    pub inbox_capacity: usize,
    /// Capacity of the connection-wide outbound channel every `Stream`
    /// writes into and the serializer task drains. `tokio::sync::mpsc`
    /// has no true zero-capacity (rendezvous) channel, so `1` is the
    /// closest stand-in for the wire model's conceptually "unbuffered"
    /// outbound channel: a writer can hand off one frame before it must
    /// wait for the serializer to take it, giving `write()` real
    /// back-pressure instead of always returning instantly.
    pub outbound_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 8,
            outbound_capacity: 1,
        }
    }
}

impl MuxConfig {
    pub fn new(inbox_capacity: usize, outbound_capacity: usize) -> Self {
        Self {
            inbox_capacity,
            outbound_capacity,
        }
    }
}

/// A message queued for the outbound serializer.
pub(crate) struct OutboundMsg {
    pub header: u64,
    pub payload: Bytes,
}

/// What the `streams` map remembers about an id.
enum Slot {
    /// Live stream; the dispatcher can deliver to it.
    Open(Arc<StreamShared>),
    /// Locally closed but the peer hasn't acknowledged with its own
    /// `Close` frame yet. Kept instead of removing the entry outright so a
    /// frame that arrives late for this id is recognized as stale traffic
    /// for a stream we already tore down, not as a brand new remotely
    /// opened stream reusing the id. See `DESIGN.md`, Open Question 1.
    LocalClosed,
}

/// State shared between a [`Multiplex`], every [`Stream`] it has handed
/// out, and the dispatch/serializer tasks.
pub(crate) struct MuxShared {
    streams: Mutex<HashMap<u64, Slot>>,
    pub(crate) outbound_tx: mpsc::Sender<OutboundMsg>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMsg>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    next_id: AtomicU64,
    initiator: bool,
    config: MuxConfig,
    fatal_error: Mutex<Option<String>>,
}

impl MuxShared {
    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// `next_id`, then advance by 2. The initiator's first id is 1, the
    /// non-initiator's is 0; both sides then step by 2 forever, so the two
    /// id spaces never collide without any coordination between peers.
    fn next_chan_id(&self) -> u64 {
        let base = self.next_id.fetch_add(2, Ordering::SeqCst);
        if self.initiator {
            base + 1
        } else {
            base
        }
    }

    fn insert_open(&self, id: u64, shared: Arc<StreamShared>) {
        self.streams.lock().insert(id, Slot::Open(shared));
    }

    /// Replace `id`'s slot with a tombstone, or no-op if the dispatcher
    /// already removed it (e.g. a remote `Close` raced with our local
    /// close and got there first).
    pub(crate) fn tombstone(&self, id: u64) {
        let mut streams = self.streams.lock();
        if let Some(slot @ Slot::Open(_)) = streams.get_mut(&id) {
            *slot = Slot::LocalClosed;
        }
    }

    fn lookup(&self, id: u64) -> Option<Slot> {
        let streams = self.streams.lock();
        match streams.get(&id) {
            Some(Slot::Open(s)) => Some(Slot::Open(s.clone())),
            Some(Slot::LocalClosed) => Some(Slot::LocalClosed),
            None => None,
        }
    }

    fn remove(&self, id: u64) {
        self.streams.lock().remove(&id);
    }
}

/// The connection-level multiplexer.
///
/// Owns the transport exclusively from construction until [`serve`] takes
/// it; holds `Arc<MuxShared>` alongside it so streams and the background
/// tasks `serve` spawns can keep working after this value is dropped by the
/// caller (the usual pattern: call `serve` in a spawned task and drop the
/// `Multiplex` value, keeping only `Stream` handles around).
///
/// [`serve`]: Multiplex::serve
pub struct Multiplex<T> {
    shared: Arc<MuxShared>,
    transport: AsyncMutex<Option<T>>,
}

impl<T> Multiplex<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(transport: T, initiator: bool) -> Self {
        Self::with_config(transport, initiator, MuxConfig::default())
    }

    pub fn with_config(transport: T, initiator: bool, config: MuxConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(MuxShared {
            streams: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            closed_tx,
            closed_rx,
            next_id: AtomicU64::new(0),
            initiator,
            config,
            fatal_error: Mutex::new(None),
        });
        Self {
            shared,
            transport: AsyncMutex::new(Some(transport)),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_for_test(this: &Self) -> Arc<MuxShared> {
        this.shared.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Open a new, unnamed, locally-initiated stream.
    pub async fn new_stream(&self) -> Result<Stream> {
        self.new_named_stream(String::new()).await
    }

    /// Open a new, locally-initiated stream and advertise `name` to the
    /// peer in the `NewStream` frame.
    pub async fn new_named_stream(&self, name: impl Into<String>) -> Result<Stream> {
        if self.shared.is_closed() {
            return Err(Error::MultiplexClosed);
        }
        let name = name.into();
        let id = self.shared.next_chan_id();
        let (stream, shared) = Stream::build(
            self.shared.clone(),
            id,
            true,
            name.clone(),
            self.shared.config.inbox_capacity,
        );
        self.shared.insert_open(id, shared);

        let msg = OutboundMsg {
            header: frame::new_stream_header(id),
            payload: Bytes::from(name.into_bytes()),
        };
        let mut closed_rx = self.shared.closed_rx.clone();
        tokio::select! {
            biased;
            _ = closed_rx.changed() => return Err(Error::MultiplexClosed),
            res = self.shared.outbound_tx.send(msg) => {
                res.map_err(|_| Error::MultiplexClosed)?;
            }
        }

        Ok(stream)
    }

    /// Run the connection: spawn the outbound serializer and drive the
    /// inbound dispatch loop inline until the transport closes or errors,
    /// handing each accepted stream to its own `tokio::spawn`'d invocation
    /// of `handler`.
    ///
    /// Returns `Ok(())` on clean shutdown (peer or local `close()`), or
    /// the first fatal transport error seen by either the dispatch loop or
    /// the serializer.
    pub async fn serve<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let transport = {
            let mut guard = self.transport.lock().await;
            guard.take().ok_or(Error::AlreadyServing)?
        };
        let (mut read_half, write_half) = tokio::io::split(transport);

        let outbound_rx = self
            .shared
            .outbound_rx
            .lock()
            .take()
            .expect("outbound receiver already taken");

        let serializer_shared = self.shared.clone();
        let serializer =
            tokio::spawn(run_serializer(serializer_shared, write_half, outbound_rx));

        let handler = Arc::new(handler);
        let dispatch_result = run_dispatch(&self.shared, &mut read_half, handler).await;

        self.shutdown_inner();

        match serializer.await {
            Ok(Ok(())) => dispatch_result,
            Ok(Err(e)) => Err(e),
            Err(_join_err) => dispatch_result,
        }
    }

    fn shutdown_inner(&self) {
        let _ = self.shared.closed_tx.send(true);
        let mut streams = self.shared.streams.lock();
        for (_, slot) in streams.drain() {
            if let Slot::Open(s) = slot {
                s.force_close();
            }
        }
    }

    /// Idempotent. Signals `closed`, which unblocks every stream's
    /// in-flight `read`/`write`/`receive` and causes `serve`'s dispatch
    /// and serializer loops to return on their next check.
    pub fn close(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        self.shutdown_inner();
        Ok(())
    }
}

async fn run_dispatch<R, F, Fut>(shared: &Arc<MuxShared>, reader: &mut R, handler: Arc<F>) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        if shared.is_closed() {
            return Ok(());
        }

        let (stream_id, tag, payload) = match frame::read_frame(reader).await {
            Ok(Some(f)) => f,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        match shared.lookup(stream_id) {
            Some(Slot::Open(stream_shared)) => {
                if matches!(tag, Tag::Close) {
                    stream_shared.force_close();
                    shared.remove(stream_id);
                } else {
                    stream_shared.receive(payload).await;
                }
            }
            Some(Slot::LocalClosed) => {
                // Stray frame for an id we already locally closed. A
                // matching Close from the peer completes the teardown;
                // anything else is trailing data we no longer want.
                if matches!(tag, Tag::Close) {
                    shared.remove(stream_id);
                }
            }
            None => {
                let name = if matches!(tag, Tag::NewStream) {
                    String::from_utf8_lossy(&payload).into_owned()
                } else {
                    String::new()
                };
                let (stream, stream_shared) = Stream::build(
                    shared.clone(),
                    stream_id,
                    false,
                    name,
                    shared.config.inbox_capacity,
                );
                shared.insert_open(stream_id, stream_shared.clone());

                let handler = handler.clone();
                tokio::spawn(async move {
                    handler(stream).await;
                });

                match tag {
                    Tag::NewStream => {
                        // payload was the name; no body to deliver.
                    }
                    Tag::Close => {
                        stream_shared.force_close();
                        shared.remove(stream_id);
                    }
                    _ => {
                        stream_shared.receive(payload).await;
                    }
                }
            }
        }
    }
}

async fn run_serializer<W>(
    shared: Arc<MuxShared>,
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<OutboundMsg>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut closed_rx = shared.closed_rx.clone();
    loop {
        tokio::select! {
            biased;
            _ = closed_rx.changed() => break,
            msg = outbound_rx.recv() => {
                match msg {
                    None => break,
                    Some(msg) => {
                        if let Err(e) = frame::write_frame(&mut writer, msg.header, &msg.payload).await {
                            tracing::warn!(error = %e, "transport write failed, shutting down multiplexer");
                            *shared.fatal_error.lock() = Some(e.to_string());
                            let _ = shared.closed_tx.send(true);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}
