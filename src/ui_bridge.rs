use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::session::{LinkEvent, LinkState};

const MESSAGE_TYPE: &str = "voice_link";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    Start,
    Stop,
}

#[derive(Deserialize)]
struct UiMessage {
    #[serde(rename = "type")]
    msg_type: String,
    command: Option<String>,
}

/// Parse one datagram from the UI process.
pub fn parse_command(msg: &str) -> Option<UiCommand> {
    let msg: UiMessage = serde_json::from_str(msg).ok()?;
    if msg.msg_type != MESSAGE_TYPE {
        return None;
    }
    match msg.command.as_deref()? {
        "start" => Some(UiCommand::Start),
        "stop" => Some(UiCommand::Stop),
        _ => None,
    }
}

pub fn status_message(active: bool, speaking: bool, state: LinkState) -> String {
    json!({
        "type": MESSAGE_TYPE,
        "active": active,
        "speaking": speaking,
        "state": state.as_str(),
    })
    .to_string()
}

pub fn event_message(event: &LinkEvent) -> String {
    match event {
        LinkEvent::Connecting => json!({"type": MESSAGE_TYPE, "event": "connecting"}),
        LinkEvent::Active => json!({"type": MESSAGE_TYPE, "event": "active"}),
        LinkEvent::Errored(reason) => {
            json!({"type": MESSAGE_TYPE, "event": "errored", "reason": reason})
        }
        LinkEvent::RemoteClosed => json!({"type": MESSAGE_TYPE, "event": "remote_closed"}),
        LinkEvent::Stopped => json!({"type": MESSAGE_TYPE, "event": "stopped"}),
    }
    .to_string()
}

/// UI进程和Core进程通过本地UDP通信，端口在配置中指定
pub struct UiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<UiCommand>,
}

impl UiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<UiCommand>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.ui_local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.ui_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.ui_buffer_size.max(64),
            tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match parse_command(msg) {
                Some(cmd) => {
                    if self.tx.send(cmd).await.is_err() {
                        log::warn!("UI command receiver gone, stopping UI bridge");
                        break;
                    }
                }
                None => log::debug!("Ignoring UI message: {}", msg),
            }
        }
        Ok(())
    }

    pub async fn send_status(
        &self,
        active: bool,
        speaking: bool,
        state: LinkState,
    ) -> anyhow::Result<()> {
        self.send_message(&status_message(active, speaking, state))
            .await
    }

    pub async fn send_event(&self, event: &LinkEvent) -> anyhow::Result<()> {
        self.send_message(&event_message(event)).await
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}
