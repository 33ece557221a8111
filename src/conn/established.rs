//! Established connection I/O
//!
//! Each established connection runs a reader task and a writer task under a
//! small supervisor. The reader feeds the framer and reports complete
//! messages to the handler loop; the writer drains the send queue under the
//! connection's rate budget and tracks the write-buffer watermarks. The
//! supervisor guarantees exactly one disconnect report per connection.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::debug;

use super::{ConnId, DisconnectReason};
use crate::config::RateLimit;
use crate::framing::MessageFramer;
use crate::handler::stats::HandlerStats;
use crate::handler::LoopEvent;
use crate::rate::ConnRate;

/// Read buffer growth increment
const READ_CHUNK: usize = 16 * 1024;

/// Close progression for an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    /// Connection is live
    Open,
    /// Finish queued writes, then close
    Drain,
    /// Close immediately
    Now,
}

/// Everything needed to bring a fresh stream into service
pub(crate) struct ConnIo {
    pub id: ConnId,
    pub outgoing: bool,
    pub stream: TcpStream,
    pub framer: Box<dyn MessageFramer>,
    pub rate: Arc<ConnRate>,
    pub events_tx: mpsc::UnboundedSender<LoopEvent>,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub stats: Arc<HandlerStats>,
}

/// Thread-safe handle to one established connection
///
/// Held in the shared connected map; every cross-thread command surface
/// (send, close, pause, rate override) goes through here. Dropping the
/// handle does not stop the connection; [`abort`](Self::abort) does.
pub(crate) struct ConnHandle {
    id: ConnId,
    pub outgoing: bool,
    write_tx: mpsc::UnboundedSender<Bytes>,
    close_tx: watch::Sender<CloseMode>,
    pause_tx: watch::Sender<bool>,
    buffered: Arc<AtomicUsize>,
    write_full: Arc<AtomicBool>,
    rate: Arc<ConnRate>,
    pub bytes_read: Arc<AtomicU64>,
    pub bytes_written: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    high_watermark: usize,
    tasks: Vec<AbortHandle>,
}

impl ConnHandle {
    /// Queue bytes for writing
    ///
    /// Returns `false` once the connection is closing or gone. Fires
    /// `on_write_buffer_full` through the loop when the queue first crosses
    /// the high watermark.
    pub(crate) fn send(&self, data: Bytes) -> bool {
        if *self.close_tx.borrow() != CloseMode::Open {
            return false;
        }
        let n = data.len();
        // Account and signal the high-water edge before the writer can see
        // the data, so `full` always precedes the matching `ready`
        let total = self.buffered.fetch_add(n, Ordering::AcqRel) + n;
        if total >= self.high_watermark && !self.write_full.swap(true, Ordering::AcqRel) {
            let _ = self.events_tx.send(LoopEvent::WriteBufferFull {
                id: self.id,
                bufsize: total,
            });
        }
        if self.write_tx.send(data).is_err() {
            self.buffered.fetch_sub(n, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Begin closing; `immediately` aborts in-flight I/O, otherwise the
    /// write queue drains first
    pub(crate) fn close(&self, immediately: bool) {
        let target = if immediately {
            CloseMode::Now
        } else {
            CloseMode::Drain
        };
        self.close_tx.send_if_modified(|mode| {
            // A drain may upgrade to an immediate close, never the reverse
            let upgrade = matches!(
                (*mode, target),
                (CloseMode::Open, _) | (CloseMode::Drain, CloseMode::Now)
            );
            if upgrade {
                *mode = target;
            }
            upgrade
        });
    }

    /// Pause or resume reads from the socket
    pub(crate) fn set_paused(&self, paused: bool) {
        let _ = self.pause_tx.send(paused);
    }

    /// Install a per-connection rate override
    pub(crate) fn set_rate_limit(&self, limit: &RateLimit) {
        self.rate.set_override(limit);
    }

    /// Current queued-but-unwritten byte count
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Kill the connection's tasks without a disconnect report
    ///
    /// Only the shutdown path uses this; it reports disconnects itself.
    pub(crate) fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Split the stream and spawn the connection's tasks
pub(crate) fn spawn_established(io: ConnIo) -> ConnHandle {
    let ConnIo {
        id,
        outgoing,
        stream,
        framer,
        rate,
        events_tx,
        high_watermark,
        low_watermark,
        stats,
    } = io;

    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(CloseMode::Open);
    let (pause_tx, pause_rx) = watch::channel(false);

    let buffered = Arc::new(AtomicUsize::new(0));
    let write_full = Arc::new(AtomicBool::new(false));
    let bytes_read = Arc::new(AtomicU64::new(0));
    let bytes_written = Arc::new(AtomicU64::new(0));

    let reader = tokio::spawn(run_reader(ReaderCtx {
        id,
        read_half,
        framer,
        rate: Arc::clone(&rate),
        pause_rx,
        close_rx: close_rx.clone(),
        events_tx: events_tx.clone(),
        bytes_read: Arc::clone(&bytes_read),
        stats: Arc::clone(&stats),
    }));

    let writer = tokio::spawn(run_writer(WriterCtx {
        id,
        write_half,
        write_rx,
        close_rx,
        rate: Arc::clone(&rate),
        buffered: Arc::clone(&buffered),
        write_full: Arc::clone(&write_full),
        low_watermark,
        events_tx: events_tx.clone(),
        bytes_written: Arc::clone(&bytes_written),
        stats,
    }));

    let reader_abort = reader.abort_handle();
    let writer_abort = writer.abort_handle();

    let sup_events = events_tx.clone();
    let supervisor = tokio::spawn(async move {
        let mut reader = reader;
        let mut writer = writer;
        let reason = tokio::select! {
            r = &mut reader => r.unwrap_or(DisconnectReason::TransportError),
            w = &mut writer => w.unwrap_or(DisconnectReason::TransportError),
        };
        reader.abort();
        writer.abort();
        let _ = sup_events.send(LoopEvent::Disconnected { id, reason });
    });

    ConnHandle {
        id,
        outgoing,
        write_tx,
        close_tx,
        pause_tx,
        buffered,
        write_full,
        rate,
        bytes_read,
        bytes_written,
        events_tx,
        high_watermark,
        tasks: vec![reader_abort, writer_abort, supervisor.abort_handle()],
    }
}

struct ReaderCtx {
    id: ConnId,
    read_half: OwnedReadHalf,
    framer: Box<dyn MessageFramer>,
    rate: Arc<ConnRate>,
    pause_rx: watch::Receiver<bool>,
    close_rx: watch::Receiver<CloseMode>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    bytes_read: Arc<AtomicU64>,
    stats: Arc<HandlerStats>,
}

async fn run_reader(mut ctx: ReaderCtx) -> DisconnectReason {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        let mode = *ctx.close_rx.borrow_and_update();
        if mode == CloseMode::Now {
            return DisconnectReason::Closed;
        }
        let paused = *ctx.pause_rx.borrow_and_update();
        if paused {
            tokio::select! {
                _ = ctx.pause_rx.changed() => {}
                _ = ctx.close_rx.changed() => {}
            }
            continue;
        }

        tokio::select! {
            result = ctx.read_half.read_buf(&mut buf) => match result {
                Ok(0) => return DisconnectReason::RemoteClosed,
                Ok(n) => {
                    ctx.rate.pay_read(n).await;
                    ctx.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    ctx.stats.record_read(n as u64);

                    match ctx.framer.split(&mut buf) {
                        Ok(messages) if !messages.is_empty() => {
                            let total = messages.iter().map(Bytes::len).sum();
                            ctx.stats.record_messages(messages.len() as u64);
                            if ctx
                                .events_tx
                                .send(LoopEvent::Messages { id: ctx.id, messages, total })
                                .is_err()
                            {
                                return DisconnectReason::Closed;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(id = ctx.id, error = %e, "framing violation");
                            let _ = ctx.events_tx.send(LoopEvent::Malformed { id: ctx.id });
                            return DisconnectReason::FramingViolation;
                        }
                    }
                }
                Err(e) => {
                    debug!(id = ctx.id, error = %e, "read error");
                    return DisconnectReason::TransportError;
                }
            },
            _ = ctx.close_rx.changed() => {}
            _ = ctx.pause_rx.changed() => {}
        }
    }
}

struct WriterCtx {
    id: ConnId,
    write_half: OwnedWriteHalf,
    write_rx: mpsc::UnboundedReceiver<Bytes>,
    close_rx: watch::Receiver<CloseMode>,
    rate: Arc<ConnRate>,
    buffered: Arc<AtomicUsize>,
    write_full: Arc<AtomicBool>,
    low_watermark: usize,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    bytes_written: Arc<AtomicU64>,
    stats: Arc<HandlerStats>,
}

async fn run_writer(mut ctx: WriterCtx) -> DisconnectReason {
    loop {
        // Copy out of the watch guard; the drain branch awaits
        let mode = *ctx.close_rx.borrow_and_update();
        match mode {
            CloseMode::Now => return DisconnectReason::Closed,
            CloseMode::Drain => {
                // Senders are rejected once draining starts, so the queue
                // can only shrink from here
                while let Ok(data) = ctx.write_rx.try_recv() {
                    if write_one(&mut ctx, data).await.is_err() {
                        return DisconnectReason::TransportError;
                    }
                }
                let _ = ctx.write_half.shutdown().await;
                return DisconnectReason::Drained;
            }
            CloseMode::Open => {}
        }

        tokio::select! {
            maybe = ctx.write_rx.recv() => match maybe {
                Some(data) => {
                    if let Err(e) = write_one(&mut ctx, data).await {
                        debug!(id = ctx.id, error = %e, "write error");
                        return DisconnectReason::TransportError;
                    }
                }
                None => return DisconnectReason::Closed,
            },
            _ = ctx.close_rx.changed() => {}
        }
    }
}

async fn write_one(ctx: &mut WriterCtx, data: Bytes) -> std::io::Result<()> {
    let n = data.len();
    ctx.rate.pay_write(n).await;
    ctx.write_half.write_all(&data).await?;

    ctx.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    ctx.stats.record_written(n as u64);

    let remaining = ctx
        .buffered
        .fetch_sub(n, Ordering::AcqRel)
        .saturating_sub(n);
    if remaining <= ctx.low_watermark && ctx.write_full.swap(false, Ordering::AcqRel) {
        let _ = ctx.events_tx.send(LoopEvent::WriteBufferReady {
            id: ctx.id,
            bufsize: remaining,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::LengthDelimitedFramer;
    use crate::rate::RateGroup;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, connect.await.unwrap())
    }

    fn handle_for(
        stream: TcpStream,
        events_tx: mpsc::UnboundedSender<LoopEvent>,
        high: usize,
        low: usize,
    ) -> ConnHandle {
        spawn_established(ConnIo {
            id: 7,
            outgoing: true,
            stream,
            framer: Box::new(LengthDelimitedFramer::default()),
            rate: Arc::new(ConnRate::new(Arc::new(RateGroup::unlimited()))),
            events_tx,
            high_watermark: high,
            low_watermark: low,
            stats: Arc::new(HandlerStats::new()),
        })
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LoopEvent>) -> LoopEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event expected")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_framed_messages_reach_loop() {
        let (ours, theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = handle_for(ours, tx, 1 << 20, 1 << 10);

        let mut theirs = theirs;
        theirs
            .write_all(&LengthDelimitedFramer::encode(b"ping"))
            .await
            .unwrap();
        theirs
            .write_all(&LengthDelimitedFramer::encode(b"pong"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            match next_event(&mut rx).await {
                LoopEvent::Messages { id, messages, total } => {
                    assert_eq!(id, 7);
                    assert!(total > 0);
                    seen.extend(messages);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(&seen[0][..], b"ping");
        assert_eq!(&seen[1][..], b"pong");
        handle.abort();
    }

    #[tokio::test]
    async fn test_send_writes_to_peer() {
        let (ours, mut theirs) = pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = handle_for(ours, tx, 1 << 20, 1 << 10);

        assert!(handle.send(Bytes::from_static(b"hello peer")));

        let mut buf = [0u8; 10];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello peer");

        // The writer settles its accounting just after the bytes hit the wire
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handle.buffered() != 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_remote_close_reports_disconnect_once() {
        let (ours, theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = handle_for(ours, tx, 1 << 20, 1 << 10);

        drop(theirs);

        match next_event(&mut rx).await {
            LoopEvent::Disconnected { id, reason } => {
                assert_eq!(id, 7);
                assert!(reason.remote_initiated());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "exactly one disconnect report"
        );
        drop(handle);
    }

    #[tokio::test]
    async fn test_close_now_stops_connection() {
        let (ours, _theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = handle_for(ours, tx, 1 << 20, 1 << 10);

        handle.close(true);
        match next_event(&mut rx).await {
            LoopEvent::Disconnected { reason, .. } => {
                assert!(!reason.remote_initiated());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!handle.send(Bytes::from_static(b"late")), "send after close fails");
    }

    #[tokio::test]
    async fn test_drain_close_flushes_queue() {
        let (ours, mut theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = handle_for(ours, tx, 1 << 20, 1 << 10);

        assert!(handle.send(Bytes::from_static(b"flush me")));
        handle.close(false);

        let mut buf = [0u8; 8];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"flush me");

        match next_event(&mut rx).await {
            LoopEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::Drained);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watermark_edges_fire_once() {
        let (ours, mut theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Tiny watermarks so a single send crosses the high mark
        let handle = handle_for(ours, tx, 8, 2);

        assert!(handle.send(Bytes::from(vec![0u8; 12])));

        match next_event(&mut rx).await {
            LoopEvent::WriteBufferFull { bufsize, .. } => assert!(bufsize >= 8),
            other => panic!("unexpected event: {other:?}"),
        }

        // Draining the peer side lets the writer sink the queue
        let mut sink = vec![0u8; 12];
        theirs.read_exact(&mut sink).await.unwrap();

        match next_event(&mut rx).await {
            LoopEvent::WriteBufferReady { bufsize, .. } => assert!(bufsize <= 2),
            other => panic!("unexpected event: {other:?}"),
        }

        // The edge re-arms: a second episode fires full again
        assert!(handle.send(Bytes::from(vec![0u8; 12])));
        match next_event(&mut rx).await {
            LoopEvent::WriteBufferFull { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_malformed_stream_reports_violation() {
        let (ours, mut theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_established(ConnIo {
            id: 9,
            outgoing: false,
            stream: ours,
            framer: Box::new(LengthDelimitedFramer::with_max_frame_size(16)),
            rate: Arc::new(ConnRate::new(Arc::new(RateGroup::unlimited()))),
            events_tx: tx,
            high_watermark: 1 << 20,
            low_watermark: 1 << 10,
            stats: Arc::new(HandlerStats::new()),
        });

        // Length header way beyond the 16-byte cap
        theirs.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();

        match next_event(&mut rx).await {
            LoopEvent::Malformed { id } => assert_eq!(id, 9),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut rx).await {
            LoopEvent::Disconnected { id, reason } => {
                assert_eq!(id, 9);
                assert_eq!(reason, DisconnectReason::FramingViolation);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        drop(handle);
    }

    #[tokio::test]
    async fn test_pause_blocks_delivery() {
        let (ours, mut theirs) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = handle_for(ours, tx, 1 << 20, 1 << 10);

        handle.set_paused(true);
        // Give the reader a moment to observe the pause
        tokio::time::sleep(Duration::from_millis(50)).await;

        theirs
            .write_all(&LengthDelimitedFramer::encode(b"held"))
            .await
            .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "paused reader must not deliver"
        );

        handle.set_paused(false);
        match next_event(&mut rx).await {
            LoopEvent::Messages { messages, .. } => {
                assert_eq!(&messages[0][..], b"held");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        handle.abort();
    }
}
