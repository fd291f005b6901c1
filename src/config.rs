use mac_address::get_mac_address;
use uuid::Uuid;

use crate::audio::AudioConfig;

const UNKNOWN_DEVICE: &str = "unknown-device";
const UNKNOWN_CLIENT: &str = "unknown-client";

/// How outbound microphone frames are framed on the websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// base64 PCM16 inside a `realtimeInput` JSON text message
    Json,
    /// raw little-endian PCM16 binary message
    Binary,
}

impl WireFormat {
    pub fn parse(s: &str) -> Result<Self, &'static str> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "text" => Ok(Self::Json),
            "binary" | "pcm" => Ok(Self::Binary),
            _ => Err("Unknown WIRE_FORMAT, expected \"json\" or \"binary\""),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    pub ws_token: String,
    pub wire_format: WireFormat,

    // 设备标识（运行时可修改）
    pub device_id: String,
    pub client_id: String,

    // 语音会话参数
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,

    // UI进程配置
    pub ui_local_port: u16,
    pub ui_remote_port: u16,
    pub ui_buffer_size: usize,

    pub audio: AudioConfig,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            ws_token: env!("WS_TOKEN").to_string(),
            wire_format: WireFormat::parse(env!("WIRE_FORMAT"))?,

            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),

            model: env!("SESSION_MODEL").to_string(),
            voice: non_empty(env!("SESSION_VOICE")),
            system_instruction: non_empty(env!("SESSION_SYSTEM_INSTRUCTION")),

            ui_local_port: env!("UI_LOCAL_PORT")
                .parse()
                .map_err(|_| "Failed to parse UI_LOCAL_PORT")?,
            ui_remote_port: env!("UI_REMOTE_PORT")
                .parse()
                .map_err(|_| "Failed to parse UI_REMOTE_PORT")?,
            ui_buffer_size: env!("UI_BUFFER_SIZE")
                .parse()
                .map_err(|_| "Failed to parse UI_BUFFER_SIZE")?,

            audio: AudioConfig {
                capture_device: env!("CAPTURE_DEVICE").to_string(),
                playback_device: env!("PLAYBACK_DEVICE").to_string(),
                capture_channels: env!("CAPTURE_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_CHANNELS")?,
                playback_channels: env!("PLAYBACK_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
                frame_duration_ms: env!("FRAME_DURATION_MS")
                    .parse()
                    .map_err(|_| "Failed to parse FRAME_DURATION_MS")?,
                starvation_threshold_ms: env!("STARVATION_THRESHOLD_MS")
                    .parse()
                    .map_err(|_| "Failed to parse STARVATION_THRESHOLD_MS")?,
                playback_period_size: env!("PLAYBACK_PERIOD_SIZE")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
                frame_queue: env!("FRAME_QUEUE")
                    .parse()
                    .map_err(|_| "Failed to parse FRAME_QUEUE")?,
            },
        })
    }

    /// 运行时覆盖：令牌等敏感信息不必编译进二进制
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RADIO_WS_URL") {
            if !url.trim().is_empty() {
                self.ws_url = url;
            }
        }
        if let Ok(token) = std::env::var("RADIO_WS_TOKEN") {
            if !token.trim().is_empty() {
                self.ws_token = token;
            }
        }
    }

    /// 设备id和客户端id的处理：设备id优先使用MAC地址，否则生成UUID
    pub fn resolve_identity(&mut self) {
        if self.device_id == UNKNOWN_DEVICE {
            self.device_id = match get_mac_address() {
                Ok(Some(mac)) => mac.to_string().to_lowercase(),
                _ => Uuid::new_v4().to_string(),
            };
        }
        if self.client_id == UNKNOWN_CLIENT {
            self.client_id = Uuid::new_v4().to_string();
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
