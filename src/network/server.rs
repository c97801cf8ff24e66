//! AgentLink Server
//!
//! Accepts WebSocket connections from agents and runs one session per
//! connection through the session engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use uuid::Uuid;

use super::connection::{Connection, ConnectionError, ConnectionHandle, Incoming};
use super::registry::{ClientInfo, SessionRegistry};
use super::NetworkConfig;
use crate::protocol::{Codec, Message};
use crate::session::{Session, SessionEngine};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// An agent connected and its session was registered
    SessionOpened { session_id: Uuid, addr: SocketAddr },
    /// A session ended and was released
    SessionClosed {
        session_id: Uuid,
        addr: SocketAddr,
        reason: String,
    },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Shared pieces every connection task needs
#[derive(Clone)]
struct SessionContext {
    engine: Arc<SessionEngine>,
    codec: Arc<dyn Codec>,
    registry: SessionRegistry,
    event_tx: mpsc::Sender<ServerEvent>,
    channel_capacity: usize,
    upgrade_timeout: Duration,
}

impl SessionContext {
    /// Events are advisory; drop them if the consumer lags
    fn emit(&self, event: ServerEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::trace!("Server event dropped");
        }
    }
}

/// AgentLink Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Protocol engine shared by all sessions
    engine: Arc<SessionEngine>,
    /// Live sessions
    registry: SessionRegistry,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    /// Bound address once started
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig, engine: SessionEngine) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            engine: Arc::new(engine),
            registry: SessionRegistry::new(),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = self.config.listen_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!(
            "Server listening on {} ({} codec, {} license policy)",
            local_addr,
            self.config.codec,
            self.engine.policy_name()
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let ctx = SessionContext {
            engine: self.engine.clone(),
            codec: self.config.codec.build(),
            registry: self.registry.clone(),
            event_tx: self.event_tx.clone(),
            channel_capacity: self.config.channel_capacity.max(1),
            upgrade_timeout: Duration::from_millis(self.config.connect_timeout_ms),
        };
        ctx.emit(ServerEvent::Started {
            bind_addr: local_addr,
        });

        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!("New connection from {}", addr);
                                let ctx = ctx.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, addr, ctx.clone()).await {
                                        tracing::warn!("Client {} error: {}", addr, e);
                                        ctx.emit(ServerEvent::Error {
                                            message: format!("{}: {}", addr, e),
                                        });
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            ctx.emit(ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop accepting connections and tell every live agent to shut down
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        for client in self.registry.clients().await {
            tracing::debug!(
                session = %client.session_id,
                connected_for = ?client.connected_at.elapsed().unwrap_or_default(),
                "Sending shutdown to {}",
                client.addr
            );
            if let Err(e) = client.handle.send(Message::Shutdown).await {
                tracing::debug!(session = %client.session_id, "Shutdown not delivered: {}", e);
            }
        }

        Ok(())
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Run one agent connection from upgrade to release
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: SessionContext,
) -> Result<(), ConnectionError> {
    // A peer that never completes the upgrade must not hold the task
    let ws_stream = match tokio::time::timeout(ctx.upgrade_timeout, accept_async(stream)).await {
        Ok(result) => result?,
        Err(_) => return Err(ConnectionError::Timeout),
    };
    let mut conn = Connection::new(ws_stream, ctx.codec.clone(), addr.to_string());
    let mut session = Session::new(Some(addr));
    tracing::debug!(session = %session.id, codec = %ctx.codec.kind(), "WebSocket upgraded for {}", addr);

    // Create message channel for this session
    let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(ctx.channel_capacity);
    let handle = ConnectionHandle::new(msg_tx);

    ctx.registry
        .insert(ClientInfo {
            session_id: session.id,
            addr,
            connected_at: SystemTime::now(),
            handle: handle.clone(),
        })
        .await;

    ctx.emit(ServerEvent::SessionOpened {
        session_id: session.id,
        addr,
    });

    let greeting = ctx.engine.open(&mut session);

    // Main message loop
    let disconnect_reason = match conn.send_all(&greeting).await {
        Err(e) => format!("Send error: {}", e),
        Ok(()) => loop {
            tokio::select! {
                // Receive messages from the agent
                result = conn.recv() => {
                    match result {
                        Ok(Incoming::Message(message)) => {
                            let replies = ctx.engine.handle(&mut session, message).await;
                            if let Err(e) = conn.send_all(&replies).await {
                                break format!("Send error: {}", e);
                            }
                        }
                        Ok(Incoming::Malformed(e)) => {
                            ctx.engine.decode_failed(&mut session, &e);
                        }
                        Ok(Incoming::Closed(code)) => {
                            break match code {
                                Some(code) => format!("Closed by agent (code {})", code),
                                None => "Connection closed".to_string(),
                            };
                        }
                        Err(e) => {
                            break format!("Error: {}", e);
                        }
                    }
                }

                // Messages pushed from outside the session
                Some(message) = msg_rx.recv() => {
                    let shutdown = message == Message::Shutdown;
                    if let Err(e) = conn.send(&message).await {
                        break format!("Send error: {}", e);
                    }
                    if shutdown {
                        break "Server shutting down".to_string();
                    }
                }
            }
        },
    };

    // Clean up
    handle.mark_disconnected();
    ctx.registry.remove(&session.id).await;
    ctx.engine.close(&mut session, &disconnect_reason);

    let stats = conn.stats();
    tracing::debug!(
        session = %session.id,
        peer = conn.peer(),
        sent = stats.messages_sent,
        received = stats.messages_received,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        "Connection stats"
    );

    ctx.emit(ServerEvent::SessionClosed {
        session_id: session.id,
        addr,
        reason: disconnect_reason,
    });

    if let Err(e) = conn.close().await {
        tracing::debug!(session = %session.id, "Close after session end failed: {}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Client;
    use crate::protocol::{
        CodecKind, FeatureToggle, HandshakeInfo, LicenseStatus, WireFrame,
    };
    use crate::session::{
        default_features, AlwaysValid, EngineOptions, LicensePolicy, Revoked,
    };
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(codec: CodecKind) -> NetworkConfig {
        NetworkConfig::new(0)
            .with_bind_address("127.0.0.1")
            .with_codec(codec)
    }

    async fn start_server(codec: CodecKind, policy: Arc<dyn LicensePolicy>) -> (Server, String) {
        let engine = SessionEngine::new(policy, EngineOptions::default());
        let mut server = Server::new(test_config(codec), engine);
        let addr = server.start().await.unwrap();
        (server, format!("ws://{}", addr))
    }

    async fn connect(url: &str, codec: CodecKind) -> Client {
        Client::connect(url, codec, WAIT).await.unwrap()
    }

    async fn next(client: &mut Client) -> Message {
        client.recv_timeout(WAIT).await.unwrap().unwrap()
    }

    async fn wait_for_sessions(server: &Server, expected: usize) {
        for _ in 0..100 {
            if server.session_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} live sessions", expected);
    }

    fn handshake() -> Message {
        Message::Handshake(HandshakeInfo {
            version: Some("2.1.9".to_string()),
            domain: Some("example.com".to_string()),
            tab_id: None,
        })
    }

    #[tokio::test]
    async fn test_server_creation() {
        let engine = SessionEngine::new(Arc::new(AlwaysValid::new("K")), EngineOptions::default());
        let server = Server::new(NetworkConfig::default(), engine);
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_handshake_scenario_json() {
        let (_server, url) = start_server(CodecKind::Json, Arc::new(AlwaysValid::new("K"))).await;
        let mut client = connect(&url, CodecKind::Json).await;

        client
            .send_frame(WireFrame::Text(
                r#"{"action":"handshake","data":{"version":"2.1.9","domain":"example.com"}}"#
                    .to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(next(&mut client).await, Message::License(LicenseStatus::valid("K")));
        match next(&mut client).await {
            Message::Config(snapshot) => assert_eq!(snapshot.features, default_features()),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_before_handshake_cbor() {
        let (_server, url) = start_server(CodecKind::Cbor, Arc::new(AlwaysValid::new("K"))).await;
        let mut client = connect(&url, CodecKind::Cbor).await;

        client.send(&Message::Ping).await.unwrap();
        assert!(matches!(next(&mut client).await, Message::Pong { .. }));

        // Nothing else was queued behind the pong
        client.send(&Message::RequestConfig).await.unwrap();
        assert!(matches!(next(&mut client).await, Message::Config(_)));
    }

    #[tokio::test]
    async fn test_toggle_flow() {
        let (_server, url) = start_server(CodecKind::Json, Arc::new(AlwaysValid::new("K"))).await;
        let mut client = connect(&url, CodecKind::Json).await;

        // Ignored before the handshake: the ping reply comes first
        client
            .send(&Message::ToggleFeature(FeatureToggle {
                feature: "quickLoot".to_string(),
                enabled: false,
            }))
            .await
            .unwrap();
        client.send(&Message::Ping).await.unwrap();
        assert!(matches!(next(&mut client).await, Message::Pong { .. }));

        client.send(&handshake()).await.unwrap();
        next(&mut client).await;
        next(&mut client).await;

        client
            .send(&Message::ToggleFeature(FeatureToggle {
                feature: "quickLoot".to_string(),
                enabled: false,
            }))
            .await
            .unwrap();
        match next(&mut client).await {
            Message::Config(snapshot) => {
                assert_eq!(snapshot.features["quickLoot"], false);
                assert_eq!(snapshot.features["autoHeal"], false);
                assert_eq!(snapshot.features["tooltipHints"], true);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_connection() {
        let (server, url) = start_server(CodecKind::Json, Arc::new(AlwaysValid::new("K"))).await;
        let mut client = connect(&url, CodecKind::Json).await;

        client.send_frame(WireFrame::Text("{oops".to_string())).await.unwrap();
        client.send_frame(WireFrame::Text(r#"{"data":1}"#.to_string())).await.unwrap();
        client
            .send_frame(WireFrame::Text(r#"{"action":"dance"}"#.to_string()))
            .await
            .unwrap();
        client.send(&Message::Ping).await.unwrap();

        assert!(matches!(next(&mut client).await, Message::Pong { .. }));
        assert_eq!(server.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_refused_license_sends_shutdown() {
        let (_server, url) =
            start_server(CodecKind::Json, Arc::new(Revoked::new("K", "expired"))).await;
        let mut client = connect(&url, CodecKind::Json).await;

        client.send(&handshake()).await.unwrap();

        match next(&mut client).await {
            Message::License(status) => assert!(!status.valid),
            other => panic!("Wrong message type: {:?}", other),
        }
        assert_eq!(next(&mut client).await, Message::Shutdown);
    }

    struct SlowPolicy;

    #[async_trait]
    impl LicensePolicy for SlowPolicy {
        async fn evaluate(&self, _session: &Session) -> LicenseStatus {
            tokio::time::sleep(Duration::from_millis(100)).await;
            LicenseStatus::valid("SLOW")
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_async_policy_preserves_order() {
        let (_server, url) = start_server(CodecKind::Json, Arc::new(SlowPolicy)).await;
        let mut client = connect(&url, CodecKind::Json).await;

        client.send(&handshake()).await.unwrap();
        client.send(&Message::Ping).await.unwrap();

        assert!(matches!(next(&mut client).await, Message::License(_)));
        assert!(matches!(next(&mut client).await, Message::Config(_)));
        assert!(matches!(next(&mut client).await, Message::Pong { .. }));
    }

    #[tokio::test]
    async fn test_session_released_on_close() {
        let (mut server, url) =
            start_server(CodecKind::Json, Arc::new(AlwaysValid::new("K"))).await;
        let mut events = server.take_event_receiver().unwrap();

        let mut first = connect(&url, CodecKind::Json).await;
        let mut second = connect(&url, CodecKind::Json).await;
        wait_for_sessions(&server, 2).await;

        first.close().await.unwrap();
        wait_for_sessions(&server, 1).await;

        // The other session is unaffected
        second.send(&Message::Ping).await.unwrap();
        assert!(matches!(next(&mut second).await, Message::Pong { .. }));

        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let ServerEvent::SessionClosed { reason, .. } = event {
                assert!(reason.starts_with("Closed by agent"), "{}", reason);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_stalled_upgrade_is_dropped() {
        let mut config = test_config(CodecKind::Json);
        config.connect_timeout_ms = 200;
        let engine = SessionEngine::new(Arc::new(AlwaysValid::new("K")), EngineOptions::default());
        let mut server = Server::new(config, engine);
        let addr = server.start().await.unwrap();

        // Open the socket but never send the HTTP upgrade
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(3), raw.read(&mut buf))
            .await
            .expect("server kept the stalled socket open");

        assert_eq!(read.unwrap(), 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_abrupt_drop_releases_session() {
        let (mut server, url) =
            start_server(CodecKind::Json, Arc::new(AlwaysValid::new("K"))).await;
        let mut events = server.take_event_receiver().unwrap();

        let client = connect(&url, CodecKind::Json).await;
        wait_for_sessions(&server, 1).await;

        // No close frame, the TCP connection just goes away
        drop(client);
        wait_for_sessions(&server, 0).await;

        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let ServerEvent::SessionClosed { reason, .. } = event {
                assert!(!reason.starts_with("Closed by agent"), "{}", reason);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_stop_sends_shutdown() {
        let (mut server, url) =
            start_server(CodecKind::Json, Arc::new(AlwaysValid::new("K"))).await;
        let mut client = connect(&url, CodecKind::Json).await;
        wait_for_sessions(&server, 1).await;

        server.stop().await.unwrap();

        assert_eq!(next(&mut client).await, Message::Shutdown);
        wait_for_sessions(&server, 0).await;
    }
}
