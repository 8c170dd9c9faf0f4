//! WebSocket session lifecycle: one authenticated client from upgrade
//! through disconnect.
//!
//! Each session runs two pumps. The outbound pump is the only writer to the
//! socket; it drains the connection's queue and emits keepalive Pings. The
//! inbound pump reads frames, enforces the idle deadline, and dispatches
//! requests inline. Both are generic over the transport so they can be
//! driven by in-memory channels in tests.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, instrument, warn};
use trench_core::ids::UserId;
use trench_store::MessageStore;

use super::connection::{Connection, Frame, SendOutcome};
use super::dispatch::handle_frame;
use super::hub::Hub;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::rpc::context::RpcContext;
use crate::rpc::registry::MethodRegistry;

/// Upper bound on frames folded into one coalesced write.
const MAX_COALESCED_FRAMES: usize = 64;

/// Per-connection transport settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Outbound queue length.
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Idle-read deadline, measured from the last Pong.
    pub pong_wait: Duration,
    /// Interval between server Pings. Must be below `pong_wait`.
    pub ping_interval: Duration,
    /// Bound on every socket write.
    pub write_wait: Duration,
    /// Join already-queued frames with `\n` into one write.
    pub coalesce_frames: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            max_message_size: 65_536,
            pong_wait: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_wait: Duration::from_secs(10),
            coalesce_frames: false,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Outbound queue closed by teardown; Close frame sent.
    QueueClosed,
    /// Peer sent Close or ended the stream.
    PeerClosed,
    /// Socket read or write failed.
    TransportError,
    /// A write did not finish within `write_wait`.
    WriteTimeout,
    /// No Pong within `pong_wait`.
    IdleTimeout,
    /// Connection closed from elsewhere (hub eviction, shutdown).
    Cancelled,
    /// Inbound frame above `max_message_size`.
    FrameTooLarge,
    /// A reply did not fit in the outbound queue.
    QueueOverflow,
}

impl PumpExit {
    /// Metric and log label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueClosed => "queue_closed",
            Self::PeerClosed => "peer_closed",
            Self::TransportError => "transport_error",
            Self::WriteTimeout => "write_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::Cancelled => "cancelled",
            Self::FrameTooLarge => "frame_too_large",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}

/// Run a WebSocket session for an authenticated user.
#[instrument(skip_all, fields(user_id = %user_id, connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    user_id: UserId,
    registry: Arc<MethodRegistry>,
    hub: Hub,
    store: Arc<dyn MessageStore>,
    config: SessionConfig,
) {
    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::channel::<Frame>(config.send_queue_capacity.max(1));
    let connection = Arc::new(Connection::new(user_id, tx));
    let _ = tracing::Span::current().record("connection_id", tracing::field::display(&connection.id));

    if hub.register(connection.clone()).await.is_err() {
        warn!("hub stopped, refusing connection");
        let _ = connection.close();
        return;
    }
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(write_pump(sink, rx, connection.clone(), config));
    let ctx = RpcContext::new(connection.clone(), hub.clone(), store);
    let read_exit = read_pump(stream, &ctx, &registry, config).await;

    if hub.unregister(connection.clone()).await.is_err() {
        let _ = connection.close();
    }
    let write_exit = match timeout(config.write_wait, &mut writer).await {
        Ok(Ok(exit)) => Some(exit),
        _ => {
            writer.abort();
            None
        }
    };

    info!(
        reason = read_exit.as_str(),
        writer = write_exit.map_or("aborted", PumpExit::as_str),
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => read_exit.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// Single writer for one socket.
///
/// Drains `rx` in FIFO order and sends a Ping every `ping_interval`. When
/// the queue closes it sends a Close frame and returns. Any other exit
/// closes the connection so the inbound side stops too.
pub async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Frame>,
    connection: Arc<Connection>,
    config: SessionConfig,
) -> PumpExit
where
    S: Sink<Message> + Unpin,
{
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    let exit = loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(first) = frame else {
                    let _ = write(&mut sink, Message::Close(None), config.write_wait).await;
                    break PumpExit::QueueClosed;
                };
                let text = if config.coalesce_frames {
                    coalesce(&first, &mut rx)
                } else {
                    first.to_string()
                };
                if let Err(exit) = write(&mut sink, Message::Text(text.into()), config.write_wait).await {
                    break exit;
                }
            }
            _ = ping.tick() => {
                if let Err(exit) = write(&mut sink, Message::Ping(Vec::new().into()), config.write_wait).await {
                    break exit;
                }
            }
        }
    };

    if exit != PumpExit::QueueClosed {
        debug!(reason = exit.as_str(), "outbound pump failed");
        let _ = connection.close();
    }
    exit
}

async fn write<S>(sink: &mut S, message: Message, wait: Duration) -> Result<(), PumpExit>
where
    S: Sink<Message> + Unpin,
{
    match timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(PumpExit::TransportError),
        Err(_) => Err(PumpExit::WriteTimeout),
    }
}

fn coalesce(first: &Frame, rx: &mut mpsc::Receiver<Frame>) -> String {
    let mut out = String::from(&**first);
    for _ in 1..MAX_COALESCED_FRAMES {
        let Ok(next) = rx.try_recv() else { break };
        out.push('\n');
        out.push_str(&next);
    }
    out
}

/// Read loop for one socket.
///
/// Ends on Close, stream end, read error, idle deadline, oversized frame,
/// reply overflow, or when the connection is closed elsewhere.
pub async fn read_pump<R, E>(
    mut stream: R,
    ctx: &RpcContext,
    registry: &MethodRegistry,
    config: SessionConfig,
) -> PumpExit
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let connection = &ctx.connection;
    loop {
        let idle = config.pong_wait.saturating_sub(connection.last_pong_elapsed());
        let next = tokio::select! {
            biased;
            () = connection.closed() => return PumpExit::Cancelled,
            () = tokio::time::sleep(idle) => {
                if connection.last_pong_elapsed() >= config.pong_wait {
                    warn!(timeout = ?config.pong_wait, "client unresponsive, disconnecting");
                    return PumpExit::IdleTimeout;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let message = match next {
            None => return PumpExit::PeerClosed,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                return PumpExit::TransportError;
            }
            Some(Ok(message)) => message,
        };

        let text = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(len = data.len(), "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                connection.mark_alive();
                continue;
            }
            Message::Close(_) => {
                debug!("client sent close frame");
                return PumpExit::PeerClosed;
            }
        };

        if text.len() > config.max_message_size {
            warn!(len = text.len(), max = config.max_message_size, "frame too large");
            return PumpExit::FrameTooLarge;
        }

        let Some(reply) = handle_frame(text, registry, ctx).await else {
            continue;
        };
        match connection.send(Frame::from(reply)) {
            SendOutcome::Queued => {}
            SendOutcome::Overflow => {
                warn!("outbound queue full, disconnecting");
                return PumpExit::QueueOverflow;
            }
            SendOutcome::Closed => return PumpExit::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::register_all;
    use crate::rpc::handlers::test_helpers::make_test_context;
    use assert_matches::assert_matches;
    use futures::channel::mpsc as fmpsc;
    use serde_json::Value;

    type Inbound = Result<Message, String>;

    fn test_config() -> SessionConfig {
        SessionConfig {
            send_queue_capacity: 8,
            max_message_size: 1024,
            pong_wait: Duration::from_secs(10),
            ping_interval: Duration::from_secs(9),
            write_wait: Duration::from_secs(1),
            coalesce_frames: false,
        }
    }

    fn chat_registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        register_all(&mut registry);
        registry
    }

    fn make_connection(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Connection::new(UserId::new(), tx)), rx)
    }

    fn texts(out: &mut fmpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        std::iter::from_fn(|| out.try_next().ok().flatten()).collect()
    }

    #[tokio::test]
    async fn write_pump_drains_in_order_then_closes() {
        let (conn, rx) = make_connection(8);
        for s in ["a", "b", "c"] {
            assert_eq!(conn.send(Frame::from(s)), SendOutcome::Queued);
        }
        let _ = conn.close();

        let (sink, mut out) = fmpsc::unbounded::<Message>();
        let exit = write_pump(sink, rx, conn, test_config()).await;
        assert_eq!(exit, PumpExit::QueueClosed);

        let sent = texts(&mut out);
        assert_eq!(sent.len(), 4);
        for (m, want) in sent.iter().zip(["a", "b", "c"]) {
            assert_matches!(m, Message::Text(t) if t.as_str() == want);
        }
        assert_matches!(sent[3], Message::Close(None));
    }

    #[tokio::test]
    async fn write_pump_coalesces_queued_frames() {
        let (conn, rx) = make_connection(8);
        for s in ["one", "two", "three"] {
            let _ = conn.send(Frame::from(s));
        }
        let _ = conn.close();

        let (sink, mut out) = fmpsc::unbounded::<Message>();
        let config = SessionConfig {
            coalesce_frames: true,
            ..test_config()
        };
        let _ = write_pump(sink, rx, conn, config).await;

        let sent = texts(&mut out);
        assert_matches!(&sent[0], Message::Text(t) if t.as_str() == "one\ntwo\nthree");
        assert_matches!(sent[1], Message::Close(None));
    }

    #[tokio::test(start_paused = true)]
    async fn write_pump_pings_on_interval() {
        let (conn, rx) = make_connection(8);
        let (sink, mut out) = fmpsc::unbounded::<Message>();
        let config = test_config();
        let pump = tokio::spawn(write_pump(sink, rx, conn.clone(), config));

        tokio::time::sleep(config.ping_interval + Duration::from_millis(1)).await;
        assert_matches!(out.next().await, Some(Message::Ping(_)));

        let _ = conn.close();
        assert_eq!(pump.await.unwrap(), PumpExit::QueueClosed);
    }

    #[tokio::test]
    async fn write_failure_closes_connection() {
        let (conn, rx) = make_connection(8);
        let (sink, out) = fmpsc::unbounded::<Message>();
        drop(out);
        let _ = conn.send(Frame::from("lost"));

        let exit = write_pump(sink, rx, conn.clone(), test_config()).await;
        assert_eq!(exit, PumpExit::TransportError);
        assert!(conn.is_closed());
    }

    /// A sink that never accepts a message.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = String;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), String>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _: Message) -> Result<(), String> {
            Err("not ready".into())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), String>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), String>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let (conn, rx) = make_connection(8);
        let _ = conn.send(Frame::from("stuck"));
        let config = test_config();

        let started = tokio::time::Instant::now();
        let exit = write_pump(StalledSink, rx, conn.clone(), config).await;
        assert_eq!(exit, PumpExit::WriteTimeout);
        assert!(started.elapsed() >= config.write_wait);
        assert!(started.elapsed() < config.ping_interval);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn read_pump_stops_when_replies_overflow() {
        let t = make_test_context().await;
        let (tx, mut rx) = mpsc::channel(1);
        let conn = Arc::new(Connection::new(UserId::new(), tx));
        t.ctx.hub.register(conn.clone()).await.unwrap();
        let ctx = RpcContext::new(conn, t.ctx.hub.clone(), t.ctx.store.clone());

        let (feed, stream) = fmpsc::unbounded::<Inbound>();
        for id in [1, 2] {
            feed.unbounded_send(Ok(Message::Text(
                format!(r#"{{"jsonrpc":"2.0","method":"nope","id":{id}}}"#).into(),
            )))
            .unwrap();
        }

        let exit = read_pump(stream, &ctx, &chat_registry(), test_config()).await;
        assert_eq!(exit, PumpExit::QueueOverflow);
        assert_eq!(ctx.connection.drop_count(), 1);
        let first: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["id"], 1);
    }

    #[tokio::test]
    async fn read_pump_dispatches_text_and_binary() {
        let mut t = make_test_context().await;
        let registry = chat_registry();
        let (feed, stream) = fmpsc::unbounded::<Inbound>();
        feed.unbounded_send(Ok(Message::Text(
            r#"{"jsonrpc":"2.0","method":"nope","id":5}"#.into(),
        )))
        .unwrap();
        feed.unbounded_send(Ok(Message::Binary(
            br#"{"jsonrpc":"2.0","method":"nope","id":6}"#.to_vec().into(),
        )))
        .unwrap();
        feed.unbounded_send(Ok(Message::Binary(vec![0xff, 0xfe].into())))
            .unwrap();
        drop(feed);

        let exit = read_pump(stream, &t.ctx, &registry, test_config()).await;
        assert_eq!(exit, PumpExit::PeerClosed);

        for want in [5, 6] {
            let frame = t.rx.try_recv().unwrap();
            let value: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["id"], want);
            assert_eq!(value["error"]["code"], -32601);
        }
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_pump_ignores_garbage() {
        let mut t = make_test_context().await;
        let (feed, stream) = fmpsc::unbounded::<Inbound>();
        feed.unbounded_send(Ok(Message::Text("{{nope".into()))).unwrap();
        feed.unbounded_send(Ok(Message::Close(None))).unwrap();

        let exit = read_pump(stream, &t.ctx, &chat_registry(), test_config()).await;
        assert_eq!(exit, PumpExit::PeerClosed);
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_pump_rejects_oversized_frame() {
        let t = make_test_context().await;
        let (feed, stream) = fmpsc::unbounded::<Inbound>();
        feed.unbounded_send(Ok(Message::Text("x".repeat(2048).into())))
            .unwrap();

        let exit = read_pump(stream, &t.ctx, &chat_registry(), test_config()).await;
        assert_eq!(exit, PumpExit::FrameTooLarge);
    }

    #[tokio::test]
    async fn read_pump_stops_on_transport_error() {
        let t = make_test_context().await;
        let (feed, stream) = fmpsc::unbounded::<Inbound>();
        feed.unbounded_send(Err("reset".into())).unwrap();

        let exit = read_pump(stream, &t.ctx, &chat_registry(), test_config()).await;
        assert_eq!(exit, PumpExit::TransportError);
    }

    #[tokio::test]
    async fn read_pump_stops_when_connection_closed() {
        let t = make_test_context().await;
        let (_feed, stream) = fmpsc::unbounded::<Inbound>();
        let _ = t.ctx.connection.close();

        let exit = read_pump(stream, &t.ctx, &chat_registry(), test_config()).await;
        assert_eq!(exit, PumpExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn read_pump_times_out_without_pong() {
        let t = make_test_context().await;
        let (_feed, stream) = fmpsc::unbounded::<Inbound>();
        let config = test_config();

        let started = tokio::time::Instant::now();
        let exit = read_pump(stream, &t.ctx, &chat_registry(), config).await;
        assert_eq!(exit, PumpExit::IdleTimeout);
        assert!(started.elapsed() >= config.pong_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_deadline() {
        let t = make_test_context().await;
        let (feed, stream) = fmpsc::unbounded::<Inbound>();
        let config = test_config();
        let ctx = t.ctx.clone();
        let reader = tokio::spawn(async move {
            read_pump(stream, &ctx, &chat_registry(), config).await
        });

        tokio::time::sleep(Duration::from_secs(8)).await;
        feed.unbounded_send(Ok(Message::Pong(Vec::new().into()))).unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!reader.is_finished());

        let exit = reader.await.unwrap();
        assert_eq!(exit, PumpExit::IdleTimeout);
    }

    #[test]
    fn exit_labels_are_distinct() {
        let all = [
            PumpExit::QueueClosed,
            PumpExit::PeerClosed,
            PumpExit::TransportError,
            PumpExit::WriteTimeout,
            PumpExit::IdleTimeout,
            PumpExit::Cancelled,
            PumpExit::FrameTooLarge,
            PumpExit::QueueOverflow,
        ];
        let labels: std::collections::HashSet<_> = all.iter().map(|e| e.as_str()).collect();
        assert_eq!(labels.len(), all.len());
    }
}
