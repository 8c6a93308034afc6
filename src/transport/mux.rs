//! Per-connection multiplexer.
//!
//! Several typed sub-channels share one byte stream. Receivers are
//! registered on a [`MuxBuilder`]; [`MuxBuilder::start`] then spawns the
//! decode loop, so nothing can be registered once frames are flowing.
//!
//! Frames for a type with no registered receiver are dropped.
//! Inbound queues are unbounded so the decode loop never stalls behind a
//! slow consumer of one sub-channel while another (e.g. `Done`) waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::protocol::{Message, MessageType};
use super::{recv_message, send_message, BoxStream, Codec, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{Error, Result};

/// Upper bound on flushing the write side while closing.
const WRITE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Routes one decoded frame into its typed queue. Returns `false` when the
/// frame could not be delivered.
type Route = Box<dyn Fn(super::Frame) -> bool + Send + Sync>;

/// Collects receivers before the decode loop starts.
pub struct MuxBuilder {
    stream: BoxStream,
    codec: Arc<dyn Codec>,
    max_frame_size: usize,
    routes: HashMap<MessageType, Route>,
    parent: Option<CancellationToken>,
}

impl MuxBuilder {
    /// Start building a multiplexer over `stream`.
    pub fn new(stream: BoxStream, codec: Arc<dyn Codec>) -> Self {
        Self {
            stream,
            codec,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            routes: HashMap::new(),
            parent: None,
        }
    }

    /// Close this connection when `parent` is cancelled.
    #[must_use]
    pub fn shutdown_with(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.child_token());
        self
    }

    /// Override the maximum accepted frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Register the receiver for `M`'s sub-channel.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn receive<M: Message>(&mut self) -> mpsc::UnboundedReceiver<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        let route: Route = Box::new(move |frame| match M::from_frame(frame) {
            Some(msg) => tx.send(msg).is_ok(),
            None => false,
        });
        if self.routes.insert(M::TYPE, route).is_some() {
            debug!(kind = ?M::TYPE, "replacing receiver");
        }
        rx
    }

    /// Spawn the decode loop and return the sending half.
    pub fn start(self) -> Mux {
        let (reader, writer) = tokio::io::split(self.stream);
        let closed = self.parent.unwrap_or_else(CancellationToken::new);

        let decoder = tokio::spawn(decode_loop(
            reader,
            Arc::clone(&self.codec),
            self.routes,
            self.max_frame_size,
            closed.clone(),
        ));

        Mux {
            writer: Mutex::new(writer),
            codec: self.codec,
            max_frame_size: self.max_frame_size,
            closed,
            shut: AtomicBool::new(false),
            decoder: std::sync::Mutex::new(Some(decoder)),
        }
    }
}

/// Sending half of a multiplexed connection, plus its shutdown state.
///
/// Writes are serialized through one writer lock.
pub struct Mux {
    writer: Mutex<WriteHalf<BoxStream>>,
    codec: Arc<dyn Codec>,
    max_frame_size: usize,
    closed: CancellationToken,
    shut: AtomicBool,
    decoder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Mux {
    /// Shorthand for [`MuxBuilder::new`].
    pub fn builder(stream: BoxStream, codec: Arc<dyn Codec>) -> MuxBuilder {
        MuxBuilder::new(stream, codec)
    }

    /// Encode and send one message.
    ///
    /// A write that cannot make progress once the connection is closed is
    /// abandoned with [`Error::ConnectionClosed`]; one that completes
    /// without waiting still goes out.
    pub async fn send<M: Message>(&self, msg: M) -> Result<()> {
        let frame = msg.into_frame();
        let payload = self.codec.encode(&frame)?;
        let write = async {
            let mut writer = self.writer.lock().await;
            send_message(&mut *writer, &payload, self.max_frame_size).await
        };
        tokio::select! {
            biased;
            result = write => result,
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Token cancelled once the connection is closed from either side.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Resolves once the connection is closed from either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the connection: stop the decode loop, shut down the write side
    /// and wait for the decode loop to exit. Every receiver queue is closed
    /// when this returns. Safe to call more than once.
    ///
    /// The write side is only shut down when no send holds it; a stalled
    /// peer never keeps this from returning.
    pub async fn close(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        match self.writer.try_lock() {
            Ok(mut writer) => {
                match tokio::time::timeout(WRITE_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "write shutdown failed"),
                    Err(_) => debug!("write shutdown timed out"),
                }
            }
            Err(_) => debug!("writer busy, skipping write shutdown"),
        }

        let decoder = self
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(decoder) = decoder {
            if let Err(e) = decoder.await {
                warn!(error = %e, "decode loop did not exit cleanly");
            }
        }
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        // Lets a detached decode loop exit if close() was never called.
        self.closed.cancel();
    }
}

async fn decode_loop(
    mut reader: ReadHalf<BoxStream>,
    codec: Arc<dyn Codec>,
    routes: HashMap<MessageType, Route>,
    max_frame_size: usize,
    closed: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            result = recv_message(&mut reader, max_frame_size) => result,
        };

        let bytes = match payload {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) if e.is_disconnect() => {
                debug!(error = %e, "peer disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        };

        let frame = match codec.decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame, closing connection");
                break;
            }
        };

        let kind = frame.message_type();
        match routes.get(&kind) {
            Some(route) => {
                if !route(frame) {
                    trace!(kind = ?kind, "receiver gone, frame dropped");
                }
            }
            None => debug!(kind = ?kind, "no receiver registered, frame dropped"),
        }
    }

    closed.cancel();
    // `routes` drops here, which closes every receiver queue.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::{Completion, Request, Signal};
    use crate::transport::{Frame, JsonCodec};

    fn pair() -> (BoxStream, BoxStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    fn codec() -> Arc<dyn Codec> {
        Arc::new(JsonCodec)
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (client_io, agent_io) = pair();
        let client = Mux::builder(client_io, codec()).start();

        let mut builder = Mux::builder(agent_io, codec());
        let mut requests = builder.receive::<Request>();
        let _agent = builder.start();

        let sent = Request::new("echo", "{\"a\": [1, 2, 3]}");
        client.send(sent.clone()).await.unwrap();

        let received = requests.recv().await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.data, sent.data);
    }

    #[tokio::test]
    async fn order_is_kept_within_a_type() {
        let (agent_io, client_io) = pair();
        let agent = Mux::builder(agent_io, codec()).start();

        let mut builder = Mux::builder(client_io, codec());
        let mut logs = builder.receive::<String>();
        let _client = builder.start();

        for i in 0..100 {
            agent.send(i.to_string()).await.unwrap();
        }
        for i in 0..100 {
            assert_eq!(logs.recv().await.unwrap(), i.to_string());
        }
    }

    #[tokio::test]
    async fn unregistered_types_are_dropped() {
        let (agent_io, client_io) = pair();
        let agent = Mux::builder(agent_io, codec()).start();

        let mut builder = Mux::builder(client_io, codec());
        let mut done = builder.receive::<Completion>();
        let _client = builder.start();

        agent.send("dropped".to_string()).await.unwrap();
        agent.send(Signal::INTERRUPT).await.unwrap();
        agent.send(Completion { error: None }).await.unwrap();

        assert_eq!(done.recv().await.unwrap(), Completion { error: None });
    }

    #[tokio::test]
    async fn peer_close_closes_queues() {
        let (agent_io, client_io) = pair();
        let agent = Mux::builder(agent_io, codec()).start();

        let mut builder = Mux::builder(client_io, codec());
        let mut logs = builder.receive::<String>();
        let client = builder.start();

        agent.send("last".to_string()).await.unwrap();
        agent.close().await;

        // Buffered values are still delivered before the closed sentinel.
        assert_eq!(logs.recv().await.as_deref(), Some("last"));
        assert!(logs.recv().await.is_none());
        client.closed().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unblocks_readers() {
        let (agent_io, _client_io) = pair();
        let mut builder = Mux::builder(agent_io, codec());
        let mut signals = builder.receive::<Signal>();
        let agent = Arc::new(builder.start());

        let reader = tokio::spawn(async move { signals.recv().await });

        agent.close().await;
        agent.close().await;

        assert!(reader.await.unwrap().is_none());
        assert!(agent.is_closed());
    }

    #[tokio::test]
    async fn stalled_send_gives_up_on_close() {
        // The peer end stays open but is never read.
        let (agent_io, _client_io) = tokio::io::duplex(64);
        let agent = Arc::new(Mux::builder(Box::new(agent_io), codec()).start());

        let sender = Arc::clone(&agent);
        let blocked = tokio::spawn(async move { sender.send("x".repeat(1024)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(1), agent.close())
            .await
            .expect("close waited on a stalled writer");
        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn decodes_from_raw_stream() {
        let payload = JsonCodec
            .encode(&Frame::Log {
                line: "from the wire".to_string(),
            })
            .unwrap();
        let mut bytes = u32::try_from(payload.len()).unwrap().to_be_bytes().to_vec();
        bytes.extend_from_slice(&payload);

        let mock = tokio_test::io::Builder::new().read(&bytes).build();
        let mut builder = Mux::builder(Box::new(mock), codec());
        let mut logs = builder.receive::<String>();
        let mux = builder.start();

        assert_eq!(logs.recv().await.as_deref(), Some("from the wire"));
        assert!(logs.recv().await.is_none());
        mux.close().await;
    }

    #[tokio::test]
    async fn garbage_closes_connection() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 3, b'b', b'a', b'd'])
            .build();
        let mut builder = Mux::builder(Box::new(mock), codec());
        let mut requests = builder.receive::<Request>();
        let mux = builder.start();

        assert!(requests.recv().await.is_none());
        mux.closed().await;
        mux.close().await;
    }
}
