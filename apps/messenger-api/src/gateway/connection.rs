//! One live WebSocket session: bounded outbound queue, read/write pumps,
//! liveness timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use messenger_common::id::{prefix, prefixed_ulid};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use super::{
    Hub, HubSettings, CLOSE_LIVENESS_TIMEOUT, CLOSE_MESSAGE_TOO_BIG, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
    CLOSE_SLOW_CONSUMER, CLOSE_UNSUPPORTED_DATA,
};

/// Handle to a live socket, shared between the owning hub and the pumps.
///
/// The socket halves themselves are owned by the pumps; everything else
/// talks to the client through [`Connection::send`].
pub struct Connection {
    id: String,
    user_id: String,
    outbound: mpsc::Sender<Utf8Bytes>,
    closed: AtomicBool,
    close_frame: Mutex<Option<CloseFrame>>,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection for `user_id` and the receiving end of its
    /// outbound queue, which the write pump drains.
    pub fn new(user_id: impl Into<String>, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let conn = Arc::new(Self {
            id: prefixed_ulid(prefix::CONNECTION),
            user_id: user_id.into(),
            outbound,
            closed: AtomicBool::new(false),
            close_frame: Mutex::new(None),
            shutdown: watch::Sender::new(false),
            done: watch::Sender::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an already-serialized frame without waiting.
    ///
    /// A full queue means the client is not keeping up: the connection is
    /// closed instead of buffering further. Returns whether the frame was
    /// queued.
    pub fn send(&self, frame: Utf8Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = %self.id,
                    user_id = %self.user_id,
                    "outbound queue full, dropping slow consumer"
                );
                self.close_with(CLOSE_SLOW_CONSUMER, "slow consumer");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Serialize and queue an event.
    pub fn send_event<T: Serialize>(&self, event: &T) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(json.into()),
            Err(err) => {
                tracing::error!(?err, conn_id = %self.id, "failed to serialize outbound event");
                false
            }
        }
    }

    pub fn close(&self) -> bool {
        self.close_with(CLOSE_NORMAL, "")
    }

    /// Close with a specific close code. Idempotent: only the first call
    /// takes effect and returns `true`.
    pub fn close_with(&self, code: u16, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.close_frame.lock() = Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        });
        self.shutdown.send_replace(true);
        tracing::debug!(conn_id = %self.id, user_id = %self.user_id, code, reason, "connection closing");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The close code recorded by the first close, if any.
    pub fn close_code(&self) -> Option<u16> {
        self.close_frame.lock().as_ref().map(|f| f.code)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Resolves once both pumps have exited.
    pub async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn mark_done(&self) {
        self.done.send_replace(true);
    }

    fn take_close_frame(&self) -> Option<CloseFrame> {
        self.close_frame.lock().take()
    }
}

/// Run a socket for its whole life: admit it to `hub`, pump frames until it
/// closes, then deregister it.
pub async fn serve<H, W, R>(hub: &H, sink: W, stream: R, user_id: String)
where
    H: Hub + ?Sized,
    W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    let settings = hub.settings().clone();
    let (conn, outbound) = Connection::new(user_id, settings.send_queue_capacity);
    let writer = tokio::spawn(write_pump(conn.clone(), outbound, sink, settings.clone()));

    match hub.register(conn.clone()).await {
        Ok(()) => {
            tracing::info!(conn_id = %conn.id(), user_id = %conn.user_id(), "connection registered");
            read_pump(&conn, stream, hub, &settings).await;
            conn.close();
            hub.unregister(&conn).await;
            tracing::info!(conn_id = %conn.id(), user_id = %conn.user_id(), "connection ended");
        }
        Err(err) => {
            tracing::warn!(%err, conn_id = %conn.id(), user_id = %conn.user_id(), "connection refused");
            conn.close();
        }
    }

    let _ = writer.await;
    conn.mark_done();
}

async fn read_pump<H, R>(conn: &Arc<Connection>, mut stream: R, hub: &H, settings: &HubSettings)
where
    H: Hub + ?Sized,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        // Any inbound frame, pongs included, refreshes the liveness deadline.
        let next = tokio::select! {
            _ = conn.closed() => break,
            next = time::timeout(settings.pong_wait, stream.next()) => next,
        };

        match next {
            Err(_elapsed) => {
                conn.close_with(CLOSE_LIVENESS_TIMEOUT, "liveness timeout");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(err))) => {
                tracing::debug!(?err, conn_id = %conn.id(), "ws read error");
                conn.close_with(CLOSE_PROTOCOL_ERROR, "read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if text.len() > settings.max_frame_bytes {
                    conn.close_with(CLOSE_MESSAGE_TOO_BIG, "frame too large");
                    break;
                }
                hub.handle_frame(conn, text.as_str()).await;
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                conn.close_with(CLOSE_UNSUPPORTED_DATA, "binary frames not supported");
                break;
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
        }
    }
}

async fn write_pump<W>(conn: Arc<Connection>, mut outbound: mpsc::Receiver<Utf8Bytes>, mut sink: W, settings: HubSettings)
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ping = time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);

    loop {
        let message = tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = outbound.recv() => match frame {
                Some(text) => Message::Text(text),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match time::timeout(settings.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(?err, conn_id = %conn.id(), "ws write error");
                break;
            }
            Err(_elapsed) => {
                tracing::debug!(conn_id = %conn.id(), "ws write timed out");
                break;
            }
        }
    }

    conn.close();
    let frame = conn.take_close_frame();
    let _ = time::timeout(settings.write_wait, sink.send(Message::Close(frame))).await;
    let _ = time::timeout(settings.write_wait, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;

    use super::*;
    use crate::error::HubError;

    #[test]
    fn send_queues_until_full_then_closes() {
        let (conn, mut rx) = Connection::new("u1", 2);

        assert!(conn.send("a".into()));
        assert!(conn.send("b".into()));
        assert!(!conn.is_closed());

        // Third frame overflows: the connection is dropped, not blocked.
        assert!(!conn.send("c".into()));
        assert!(conn.is_closed());
        assert_eq!(conn.close_code(), Some(CLOSE_SLOW_CONSUMER));

        assert_eq!(rx.try_recv().unwrap().as_str(), "a");
        assert_eq!(rx.try_recv().unwrap().as_str(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_close_is_refused() {
        let (conn, mut rx) = Connection::new("u1", 4);
        conn.close();
        assert!(!conn.send("late".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_code() {
        let (conn, _rx) = Connection::new("u1", 4);
        assert!(conn.close_with(4002, "superseded"));
        assert!(!conn.close_with(1000, ""));
        assert!(!conn.close());
        assert_eq!(conn.close_code(), Some(4002));
    }

    #[tokio::test]
    async fn concurrent_close_takes_effect_once() {
        let (conn, _rx) = Connection::new("u1", 4);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.close() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        // `closed()` resolves immediately once closed.
        time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    }

    #[test]
    fn connection_ids_are_unique() {
        let (a, _) = Connection::new("u1", 1);
        let (b, _) = Connection::new("u1", 1);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("conn_"));
    }

    /// Echoes every text frame back to its sender.
    struct EchoHub {
        admit: bool,
        settings: HubSettings,
    }

    #[async_trait]
    impl Hub for EchoHub {
        fn settings(&self) -> &HubSettings {
            &self.settings
        }

        async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
            if self.admit {
                Ok(())
            } else {
                conn.close_with(super::super::CLOSE_TRY_AGAIN_LATER, "server at capacity");
                Err(HubError::AtCapacity)
            }
        }

        async fn unregister(&self, _conn: &Arc<Connection>) {}

        async fn handle_frame(&self, conn: &Arc<Connection>, text: &str) {
            conn.send(format!("echo:{text}").into());
        }
    }

    type FakeSocket = (
        fmpsc::UnboundedSender<Result<Message, axum::Error>>,
        fmpsc::UnboundedReceiver<Message>,
    );

    fn spawn_serve(admit: bool, settings: HubSettings) -> (FakeSocket, tokio::task::JoinHandle<()>) {
        let hub = EchoHub { admit, settings };
        let (client_tx, server_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Message>();
        let sink = server_tx.sink_map_err(axum::Error::new);
        let handle = tokio::spawn(async move {
            serve(&hub, sink, server_rx, "u1".to_string()).await;
        });
        ((client_tx, client_rx), handle)
    }

    fn quick_settings() -> HubSettings {
        HubSettings {
            ping_interval: Duration::from_millis(50),
            pong_wait: Duration::from_millis(300),
            write_wait: Duration::from_millis(200),
            ..HubSettings::default()
        }
    }

    async fn next_frame(rx: &mut fmpsc::UnboundedReceiver<Message>) -> Message {
        time::timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
    }

    #[tokio::test]
    async fn pumps_route_frames_through_hub() {
        let ((client_tx, mut client_rx), handle) = spawn_serve(true, HubSettings::default());

        client_tx.unbounded_send(Ok(Message::Text("hi".into()))).unwrap();
        match next_frame(&mut client_rx).await {
            Message::Text(text) => assert_eq!(text.as_str(), "echo:hi"),
            other => panic!("expected text, got {other:?}"),
        }

        client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        match next_frame(&mut client_rx).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_NORMAL),
            other => panic!("expected close, got {other:?}"),
        }
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_pump_pings_and_silence_times_out() {
        let ((_client_tx, mut client_rx), handle) = spawn_serve(true, quick_settings());

        assert!(matches!(next_frame(&mut client_rx).await, Message::Ping(_)));

        // The client never answers, so the liveness deadline expires.
        loop {
            match next_frame(&mut client_rx).await {
                Message::Ping(_) => continue,
                Message::Close(Some(frame)) => {
                    assert_eq!(frame.code, CLOSE_LIVENESS_TIMEOUT);
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connection_gets_close_code_and_no_reads() {
        let ((client_tx, mut client_rx), handle) = spawn_serve(false, HubSettings::default());

        match next_frame(&mut client_rx).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, super::super::CLOSE_TRY_AGAIN_LATER),
            other => panic!("expected close, got {other:?}"),
        }
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        drop(client_tx);
    }

    #[tokio::test]
    async fn oversized_text_frame_closes_with_message_too_big() {
        let settings = HubSettings {
            max_frame_bytes: 64,
            ..HubSettings::default()
        };
        let ((client_tx, mut client_rx), handle) = spawn_serve(true, settings);

        client_tx.unbounded_send(Ok(Message::Text("x".repeat(200).into()))).unwrap();
        match next_frame(&mut client_rx).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_MESSAGE_TOO_BIG),
            other => panic!("expected close, got {other:?}"),
        }
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_error_closes_with_protocol_error() {
        let ((client_tx, mut client_rx), handle) = spawn_serve(true, HubSettings::default());

        client_tx
            .unbounded_send(Err(axum::Error::new(std::io::Error::other("broken frame"))))
            .unwrap();
        match next_frame(&mut client_rx).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_PROTOCOL_ERROR),
            other => panic!("expected close, got {other:?}"),
        }
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn binary_frames_are_a_protocol_violation() {
        let ((client_tx, mut client_rx), handle) = spawn_serve(true, HubSettings::default());

        client_tx
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(b"\x00\x01"))))
            .unwrap();
        match next_frame(&mut client_rx).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_UNSUPPORTED_DATA),
            other => panic!("expected close, got {other:?}"),
        }
        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
