use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::config::Config;
use crate::error::LinkError;
use crate::protocol::{self, Outbound, Payload};

/// Signals from the transport to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// The connection is up and the session setup was sent.
    Open,
    Error(String),
    Message(Payload),
    /// The remote end closed the connection.
    Closed,
}

#[derive(Debug)]
pub enum NetCommand {
    Send(Outbound),
    Close,
}

/// The sending half of one live connection.
///
/// Sends are fire-and-forget: when the command queue is full or the link is
/// gone the message is dropped rather than waited on.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx_cmd: mpsc::Sender<NetCommand>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(tx_cmd: mpsc::Sender<NetCommand>) -> Self {
        Self {
            tx_cmd,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a message. Returns false if it was dropped.
    pub fn send(&self, msg: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx_cmd.try_send(NetCommand::Send(msg)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Transport queue full, dropping outbound message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        self.send(Outbound::Text(text))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.send(Outbound::Binary(data))
    }

    /// Ask the transport to close. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Full queue: the link task also ends once every handle is dropped
        let _ = self.tx_cmd.try_send(NetCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx_cmd.is_closed()
    }
}

/// The remote speech service.
#[async_trait]
pub trait SpeechEndpoint: Send + Sync {
    /// Start connecting. Returns once setup is initiated; `Open` or `Error`
    /// arrives on `events` later.
    async fn connect(
        &self,
        config: &Config,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<SessionHandle, LinkError>;
}

/// Websocket speech endpoint.
#[derive(Debug, Default, Clone)]
pub struct WsEndpoint;

#[async_trait]
impl SpeechEndpoint for WsEndpoint {
    async fn connect(
        &self,
        config: &Config,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<SessionHandle, LinkError> {
        let request = build_request(config).map_err(|e| LinkError::Connection(e.to_string()))?;
        let setup = protocol::setup_message(config)
            .map_err(|e| LinkError::Connection(format!("failed to build setup message: {e}")))?;

        let (tx_cmd, rx_cmd) = mpsc::channel::<NetCommand>(config.audio.frame_queue.max(1) * 2);
        let link = NetLink {
            url: config.ws_url.clone(),
            tx: events,
            rx_cmd,
        };
        tokio::spawn(link.run(request, setup));
        Ok(SessionHandle::new(tx_cmd))
    }
}

// 根据配置构建WebSocket请求
fn build_request(config: &Config) -> anyhow::Result<Request<()>> {
    let url = Url::parse(&config.ws_url)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => anyhow::bail!("unsupported websocket scheme: {}", other),
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => anyhow::bail!("websocket url has no host: {}", config.ws_url),
    };

    let request = Request::builder()
        .method("GET")
        .uri(config.ws_url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", config.ws_token))
        .header("Device-Id", &config.device_id)
        .header("Client-Id", &config.client_id)
        .header("Protocol-Version", "1")
        .body(())?;
    Ok(request)
}

/// One websocket connection. Ends on close, error, or when every
/// [`SessionHandle`] is gone; it never reconnects on its own.
struct NetLink {
    url: String,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
}

impl NetLink {
    async fn run(mut self, request: Request<()>, setup: String) {
        match self.connect_and_loop(request, setup).await {
            Ok(LinkEnd::Local) => log::info!("Connection to {} closed locally", self.url),
            Ok(LinkEnd::Remote) => {
                log::info!("Server closed connection");
                let _ = self.tx.send(NetEvent::Closed).await;
            }
            Err(e) => {
                log::warn!("Connection error: {}", e);
                let _ = self.tx.send(NetEvent::Error(e.to_string())).await;
            }
        }
    }

    // 连接、发送会话初始化消息，然后进入主循环
    async fn connect_and_loop(
        &mut self,
        request: Request<()>,
        setup: String,
    ) -> anyhow::Result<LinkEnd> {
        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = connect_async(request).await?;
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        log::debug!("Sending setup: {}", setup);
        write.send(Message::Text(setup.into())).await?;
        self.tx.send(NetEvent::Open).await?;

        // 主循环，处理读取和写入
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.tx.send(NetEvent::Message(Payload::Text(text.as_str().to_string()))).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.tx.send(NetEvent::Message(Payload::Binary(data))).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Close frame: {:?}", frame);
                            return Ok(LinkEnd::Remote);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(LinkEnd::Remote),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::Send(Outbound::Text(text))) => {
                            write.send(Message::Text(text.into())).await?;
                        }
                        Some(NetCommand::Send(Outbound::Binary(data))) => {
                            write.send(Message::Binary(data.into())).await?;
                        }
                        Some(NetCommand::Close) | None => {
                            // Do not wait for the server to acknowledge
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LinkEnd::Local);
                        }
                    }
                }
            }
        }
    }
}

enum LinkEnd {
    Local,
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent_and_stops_sends() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = SessionHandle::new(tx);
        assert!(handle.send(Outbound::Text("a".into())));
        handle.close();
        handle.close();
        assert!(!handle.send(Outbound::Text("b".into())));

        assert!(matches!(rx.try_recv(), Ok(NetCommand::Send(Outbound::Text(t))) if t == "a"));
        assert!(matches!(rx.try_recv(), Ok(NetCommand::Close)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SessionHandle::new(tx);
        assert!(handle.send(Outbound::Binary(vec![1, 2])));
        assert!(!handle.send(Outbound::Binary(vec![3, 4])));
    }

    #[test]
    fn request_carries_identity_headers() {
        let mut config = Config::default();
        config.ws_url = "ws://127.0.0.1:9001/live".into();
        config.ws_token = "secret".into();
        config.device_id = "vessel-7".into();
        config.client_id = "console-a".into();
        let request = build_request(&config).unwrap();
        let headers = request.headers();
        assert_eq!(headers["Host"], "127.0.0.1:9001");
        assert_eq!(headers["Authorization"], "Bearer secret");
        assert_eq!(headers["Device-Id"], "vessel-7");
        assert_eq!(headers["Client-Id"], "console-a");
    }

    #[test]
    fn non_websocket_urls_are_rejected() {
        let mut config = Config::default();
        config.ws_url = "https://speech.example.net".into();
        assert!(build_request(&config).is_err());
        config.ws_url = "not a url".into();
        assert!(build_request(&config).is_err());
    }
}
