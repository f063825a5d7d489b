//! Per-connection endpoint.
//!
//! An endpoint owns one duplex connection and runs two loops over it:
//!
//! - **inbound** reads frames, enforces the read deadline and dispatches
//!   envelopes to the registry (`join`/`exit`) or the bus bridge (`message`)
//! - **outbound** drains the connection's queue and sends liveness probes
//!
//! Either loop failing stops the other. On the way out the connection is
//! removed from every room it joined.

use crate::bridge::BusBridge;
use crate::handle::{ConnectionHandle, DEFAULT_OUTBOUND_CAPACITY};
use crate::keepalive::{KeepAlive, KeepAliveConfig};
use crate::metrics;
use crate::registry::RoomRegistry;
use bytes::Bytes;
use roomcast_protocol::{codec, EnvelopeType, ProtocolError, MAX_FRAME_SIZE};
use roomcast_transport::{
    Connection, ConnectionId, FrameSink, FrameSource, TransportError, WireMessage,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Liveness parameters.
    pub keepalive: KeepAliveConfig,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepAliveConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Terminal connection errors.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Malformed or oversized inbound frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Nothing arrived from the peer within the read deadline.
    #[error("No frame from peer within {0:?}")]
    LivenessTimeout(Duration),

    /// Writing to the peer failed or timed out.
    #[error("Write failed: {0}")]
    WriteFailure(String),

    /// Reading from the peer failed.
    #[error("Read failed: {0}")]
    ReadFailure(String),
}

impl EndpointError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointError::Protocol(_) => "protocol",
            EndpointError::LivenessTimeout(_) => "liveness_timeout",
            EndpointError::WriteFailure(_) => "write",
            EndpointError::ReadFailure(_) => "read",
        }
    }

    fn from_read(e: TransportError) -> Self {
        match e {
            TransportError::Protocol(e) => EndpointError::Protocol(e),
            e => EndpointError::ReadFailure(e.to_string()),
        }
    }
}

/// One live connection.
pub struct ConnectionEndpoint {
    connection: Box<dyn Connection>,
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<Bytes>,
    registry: Arc<RoomRegistry>,
    bridge: Arc<BusBridge>,
    config: EndpointConfig,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionEndpoint {
    /// Create an endpoint for an accepted connection.
    #[must_use]
    pub fn new(
        connection: Box<dyn Connection>,
        registry: Arc<RoomRegistry>,
        bridge: Arc<BusBridge>,
        config: EndpointConfig,
    ) -> Self {
        let (handle, outbound) =
            ConnectionHandle::channel(connection.id().clone(), config.outbound_capacity);
        let (state, _) = watch::channel(ConnectionState::Connecting);

        Self {
            connection,
            handle,
            outbound,
            registry,
            bridge,
            config,
            state,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.handle.id()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run the connection to completion.
    ///
    /// # Errors
    ///
    /// Returns the error that closed the connection. A clean close by the
    /// peer returns `Ok(())`.
    pub async fn run(self) -> Result<(), EndpointError> {
        let ConnectionEndpoint {
            connection,
            handle,
            outbound,
            registry,
            bridge,
            config,
            state,
        } = self;

        let connection_id = handle.id().clone();
        let remote = connection.remote_addr().unwrap_or_default();
        let (sink, mut source) = connection.split();

        state.send_replace(ConnectionState::Active);
        info!(connection = %connection_id, remote = %remote, "Connection active");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut writer = tokio::spawn(outbound_loop(
            connection_id.clone(),
            sink,
            outbound,
            config.keepalive,
            shutdown_rx,
        ));

        let inbound = Inbound {
            handle: &handle,
            registry: &registry,
            bridge: &bridge,
            config: &config,
        };

        // Whichever loop finishes first decides how the connection ends.
        let (result, writer_done) = tokio::select! {
            result = inbound.run(&mut *source) => (result, false),
            joined = &mut writer => (flatten_join(joined), true),
        };

        state.send_replace(ConnectionState::Closing);
        let left = registry.remove_connection(&connection_id);
        metrics::set_active_rooms(registry.room_count());
        debug!(connection = %connection_id, rooms = left.len(), "Connection closing");

        if !writer_done {
            let _ = shutdown_tx.send(true);
            if let Err(e) = flatten_join(writer.await) {
                debug!(connection = %connection_id, error = %e, "Outbound loop ended with error");
            }
        }
        drop(source);

        state.send_replace(ConnectionState::Closed);
        match &result {
            Ok(()) => info!(connection = %connection_id, "Connection closed"),
            Err(e) => {
                metrics::record_error(e.kind());
                info!(connection = %connection_id, error = %e, "Connection closed");
            }
        }

        result
    }
}

fn flatten_join(
    joined: Result<Result<(), EndpointError>, tokio::task::JoinError>,
) -> Result<(), EndpointError> {
    joined.unwrap_or_else(|e| Err(EndpointError::WriteFailure(format!("outbound task: {}", e))))
}

struct Inbound<'a> {
    handle: &'a ConnectionHandle,
    registry: &'a RoomRegistry,
    bridge: &'a BusBridge,
    config: &'a EndpointConfig,
}

impl Inbound<'_> {
    async fn run(&self, source: &mut dyn FrameSource) -> Result<(), EndpointError> {
        let mut keepalive = KeepAlive::new(self.config.keepalive);

        loop {
            let next = tokio::time::timeout_at(keepalive.deadline(), source.recv())
                .await
                .map_err(|_| EndpointError::LivenessTimeout(keepalive.window()))?;

            match next.map_err(EndpointError::from_read)? {
                Some(WireMessage::Data(frame)) => {
                    keepalive.on_frame();
                    metrics::record_message(frame.len(), "inbound");
                    self.dispatch(frame).await?;
                }
                Some(WireMessage::Pong(_)) => {
                    trace!(connection = %self.handle.id(), "Liveness acknowledged");
                    keepalive.on_frame();
                }
                Some(WireMessage::Ping(_)) => {
                    keepalive.on_frame();
                }
                None => {
                    debug!(connection = %self.handle.id(), "Peer closed connection");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, frame: Bytes) -> Result<(), EndpointError> {
        let envelope = codec::decode_with_limit(&frame, self.config.max_frame_size)?;
        let connection_id = self.handle.id();
        trace!(
            connection = %connection_id,
            kind = envelope.kind.as_str(),
            room = envelope.room_id,
            "Dispatching envelope"
        );

        match envelope.kind {
            EnvelopeType::Join => {
                if self.registry.add_member(envelope.room_id, self.handle) {
                    metrics::record_join();
                    metrics::set_active_rooms(self.registry.room_count());
                }
                debug!(
                    connection = %connection_id,
                    user = envelope.user_id,
                    room = envelope.room_id,
                    "Join"
                );
            }
            EnvelopeType::Exit => {
                if self.registry.remove_member(envelope.room_id, connection_id) {
                    metrics::set_active_rooms(self.registry.room_count());
                }
                debug!(
                    connection = %connection_id,
                    user = envelope.user_id,
                    room = envelope.room_id,
                    "Exit"
                );
            }
            EnvelopeType::Message => {
                if let Err(e) = self.bridge.publish(envelope.room_id, frame).await {
                    warn!(
                        connection = %connection_id,
                        room = envelope.room_id,
                        error = %e,
                        "Publish failed, message dropped"
                    );
                }
            }
            EnvelopeType::Unknown => {
                trace!(connection = %connection_id, "Ignoring envelope of unknown type");
            }
        }

        Ok(())
    }
}

async fn outbound_loop(
    connection_id: ConnectionId,
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::Receiver<Bytes>,
    keepalive: KeepAliveConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EndpointError> {
    let mut probe = keepalive.probe_interval();

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            frame = queue.recv() => {
                let Some(frame) = frame else { break Ok(()) };
                let len = frame.len();
                if let Err(e) = write(&mut *sink, WireMessage::Data(frame), keepalive.write_wait).await {
                    break Err(e);
                }
                metrics::record_message(len, "outbound");
            }
            _ = probe.tick() => {
                trace!(connection = %connection_id, "Sending liveness probe");
                if let Err(e) = write(&mut *sink, WireMessage::Ping(Bytes::new()), keepalive.write_wait).await {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = sink.close().await {
        trace!(connection = %connection_id, error = %e, "Close after outbound loop failed");
    }
    result
}

async fn write(
    sink: &mut dyn FrameSink,
    message: WireMessage,
    write_wait: Duration,
) -> Result<(), EndpointError> {
    match tokio::time::timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EndpointError::WriteFailure(e.to_string())),
        Err(_) => Err(EndpointError::WriteFailure(format!(
            "write timed out after {:?}",
            write_wait
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::bus::LocalBus;
    use async_trait::async_trait;
    use roomcast_protocol::Envelope;

    /// In-memory peer: frames pushed on `to_server` are read by the endpoint,
    /// frames the endpoint writes show up on `from_server`.
    struct MemoryConnection {
        id: ConnectionId,
        inbound: mpsc::UnboundedReceiver<WireMessage>,
        outbound: mpsc::UnboundedSender<WireMessage>,
    }

    struct MemoryPeer {
        to_server: Option<mpsc::UnboundedSender<WireMessage>>,
        from_server: mpsc::UnboundedReceiver<WireMessage>,
    }

    fn memory_pair(id: &str) -> (MemoryConnection, MemoryPeer) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();
        (
            MemoryConnection {
                id: id.into(),
                inbound,
                outbound,
            },
            MemoryPeer {
                to_server: Some(to_server),
                from_server,
            },
        )
    }

    impl MemoryPeer {
        fn send(&self, envelope: &Envelope) {
            let frame = codec::encode(envelope).unwrap();
            self.send_raw(frame);
        }

        fn send_raw(&self, frame: Bytes) {
            self.to_server
                .as_ref()
                .unwrap()
                .send(WireMessage::Data(frame))
                .unwrap();
        }

        async fn next_data(&mut self) -> Option<Bytes> {
            loop {
                match tokio::time::timeout(Duration::from_secs(1), self.from_server.recv()).await {
                    Ok(Some(WireMessage::Data(frame))) => return Some(frame),
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return None,
                }
            }
        }
    }

    struct MemorySink(mpsc::UnboundedSender<WireMessage>);
    struct MemorySource(mpsc::UnboundedReceiver<WireMessage>);

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
            self.0
                .send(message)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
            Ok(self.0.recv().await)
        }
    }

    impl Connection for MemoryConnection {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
            let this = *self;
            (
                Box::new(MemorySink(this.outbound)),
                Box::new(MemorySource(this.inbound)),
            )
        }
    }

    async fn relay() -> (Arc<RoomRegistry>, Arc<BusBridge>) {
        let registry = Arc::new(RoomRegistry::new());
        let bridge = Arc::new(BusBridge::new(
            Arc::new(LocalBus::new()),
            Arc::clone(&registry),
            BridgeConfig::default(),
        ));
        Arc::clone(&bridge).start().await.unwrap();
        (registry, bridge)
    }

    fn spawn_endpoint(
        connection: MemoryConnection,
        registry: &Arc<RoomRegistry>,
        bridge: &Arc<BusBridge>,
        config: EndpointConfig,
    ) -> (
        ConnectionId,
        watch::Receiver<ConnectionState>,
        tokio::task::JoinHandle<Result<(), EndpointError>>,
    ) {
        let endpoint = ConnectionEndpoint::new(
            Box::new(connection),
            Arc::clone(registry),
            Arc::clone(bridge),
            config,
        );
        let id = endpoint.id().clone();
        let watcher = endpoint.state_watcher();
        (id, watcher, tokio::spawn(endpoint.run()))
    }

    async fn wait_for_member(registry: &RoomRegistry, room: u32, id: &ConnectionId) {
        for _ in 0..100 {
            if registry.is_member(room, id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never joined room {}", id, room);
    }

    #[tokio::test]
    async fn test_join_message_self_echo() {
        let (registry, bridge) = relay().await;
        let (conn, mut peer) = memory_pair("conn-a");
        let (id, _watcher, _task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        peer.send(&Envelope::join(1, 5));
        wait_for_member(&registry, 5, &id).await;

        peer.send(&Envelope::message(1, 5, "hi"));
        let frame = peer.next_data().await.unwrap();
        assert_eq!(codec::decode(&frame).unwrap().content, "hi");
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (registry, bridge) = relay().await;
        let (conn, mut peer) = memory_pair("conn-a");
        let (id, watcher, _task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        peer.send_raw(Bytes::from_static(br#"{"type":"dance","roomId":5}"#));
        peer.send(&Envelope::join(1, 5));
        wait_for_member(&registry, 5, &id).await;

        assert_eq!(*watcher.borrow(), ConnectionState::Active);
        assert!(peer.next_data().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_failure_closes_and_leaves_rooms() {
        let (registry, bridge) = relay().await;
        let (conn, peer) = memory_pair("conn-a");
        let (id, watcher, task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        peer.send(&Envelope::join(1, 5));
        wait_for_member(&registry, 5, &id).await;

        peer.send_raw(Bytes::from_static(b"not json"));
        let result = task.await.unwrap();

        assert!(matches!(result, Err(EndpointError::Protocol(_))));
        assert_eq!(*watcher.borrow(), ConnectionState::Closed);
        assert!(!registry.is_member(5, &id));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes() {
        let (registry, bridge) = relay().await;
        let (conn, peer) = memory_pair("conn-a");
        let (_id, _watcher, task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        peer.send(&Envelope::message(1, 5, "x".repeat(MAX_FRAME_SIZE)));
        let result = task.await.unwrap();

        assert!(matches!(
            result,
            Err(EndpointError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_clean() {
        let (registry, bridge) = relay().await;
        let (conn, mut peer) = memory_pair("conn-a");
        let (id, _watcher, task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        peer.send(&Envelope::join(1, 5));
        wait_for_member(&registry, 5, &id).await;

        peer.to_server.take();
        assert!(task.await.unwrap().is_ok());
        assert!(!registry.room_exists(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (registry, bridge) = relay().await;
        let (conn, _peer) = memory_pair("conn-a");
        let (_id, _watcher, task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        let started = tokio::time::Instant::now();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(EndpointError::LivenessTimeout(_))));
        let window = KeepAliveConfig::default().initial_window();
        assert!(started.elapsed() <= window + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_are_sent_and_acks_keep_alive() {
        let (registry, bridge) = relay().await;
        let (conn, mut peer) = memory_pair("conn-a");
        let (_id, watcher, _task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        // Answer every probe for several read windows
        for _ in 0..6 {
            match peer.from_server.recv().await {
                Some(WireMessage::Ping(data)) => {
                    peer.to_server
                        .as_ref()
                        .unwrap()
                        .send(WireMessage::Pong(data))
                        .unwrap();
                }
                other => panic!("expected probe, got {:?}", other),
            }
        }

        assert_eq!(*watcher.borrow(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_connection_open() {
        let registry = Arc::new(RoomRegistry::new());
        let bus = Arc::new(LocalBus::new());
        let bridge = Arc::new(BusBridge::new(
            bus.clone(),
            Arc::clone(&registry),
            BridgeConfig::default(),
        ));
        Arc::clone(&bridge).start().await.unwrap();
        bus.set_available(false);

        let (conn, mut peer) = memory_pair("conn-a");
        let (id, watcher, _task) =
            spawn_endpoint(conn, &registry, &bridge, EndpointConfig::default());

        peer.send(&Envelope::message(1, 5, "lost"));
        peer.send(&Envelope::join(1, 5));
        wait_for_member(&registry, 5, &id).await;

        assert_eq!(*watcher.borrow(), ConnectionState::Active);
        assert!(peer.next_data().await.is_none());
        assert_eq!(*watcher.borrow(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_write_failure_closes() {
        let (registry, bridge) = relay().await;
        let (conn, peer) = memory_pair("conn-a");
        let config = EndpointConfig {
            keepalive: KeepAliveConfig::new(Duration::from_millis(50), Duration::from_secs(1)),
            ..Default::default()
        };
        let MemoryPeer {
            to_server,
            from_server,
        } = peer;
        drop(from_server);

        let (_id, _watcher, task) = spawn_endpoint(conn, &registry, &bridge, config);
        let result = task.await.unwrap();

        assert!(matches!(result, Err(EndpointError::WriteFailure(_))));
        drop(to_server);
    }
}
