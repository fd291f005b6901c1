use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    session: Session,
    audio: Audio,
    ui: Ui,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
    wire_format: String,
}

#[derive(Deserialize)]
struct Session {
    model: String,
    voice: String,
    system_instruction: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_channels: u32,
    playback_channels: u32,
    frame_duration_ms: u32,
    starvation_threshold_ms: u32,
    playback_period_size: usize,
    frame_queue: usize,
}

#[derive(Deserialize)]
struct Ui {
    local_port: u16,
    remote_port: u16,
    buffer_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);
    println!("cargo:rustc-env=WIRE_FORMAT={}", config.network.wire_format);

    // 会话配置
    println!("cargo:rustc-env=SESSION_MODEL={}", config.session.model);
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);
    println!(
        "cargo:rustc-env=SESSION_SYSTEM_INSTRUCTION={}",
        config.session.system_instruction.replace('\n', " ")
    );

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=CAPTURE_CHANNELS={}", config.audio.capture_channels);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=FRAME_DURATION_MS={}", config.audio.frame_duration_ms);
    println!(
        "cargo:rustc-env=STARVATION_THRESHOLD_MS={}",
        config.audio.starvation_threshold_ms
    );
    println!(
        "cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}",
        config.audio.playback_period_size
    );
    println!("cargo:rustc-env=FRAME_QUEUE={}", config.audio.frame_queue);

    // UI 桥配置
    println!("cargo:rustc-env=UI_LOCAL_PORT={}", config.ui.local_port);
    println!("cargo:rustc-env=UI_REMOTE_PORT={}", config.ui.remote_port);
    println!("cargo:rustc-env=UI_BUFFER_SIZE={}", config.ui.buffer_size);
}
