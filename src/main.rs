use std::sync::Arc;

use fleet_radio::ui_bridge::{UiBridge, UiCommand};
use fleet_radio::{Config, VoiceLink};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

async fn publish_status(ui: &UiBridge, link: &VoiceLink) {
    if let Err(e) = ui
        .send_status(
            link.is_link_active(),
            link.is_agent_speaking(),
            link.link_state(),
        )
        .await
    {
        log::warn!("Failed to send status to UI: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();
    log::info!("{} v{} starting", env!("APP_NAME"), env!("APP_VERSION"));

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.apply_env_overrides();
    config.resolve_identity();
    log::info!(
        "Device ID: {}, Client ID: {}",
        config.device_id,
        config.client_id
    );

    // 启动UI桥，与UI进程通信
    let (tx_ui, mut rx_ui) = mpsc::channel::<UiCommand>(16);
    let ui_bridge = Arc::new(UiBridge::new(&config, tx_ui).await?);
    let ui_bridge_clone = ui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = ui_bridge_clone.run().await {
            log::error!("UiBridge error: {}", e);
        }
    });

    let mut link = VoiceLink::alsa(config);
    let mut state_rx = link.watch_link_state();
    let mut speaking_rx = link.watch_agent_speaking();
    let mut events = link.subscribe();

    if let Err(e) = link.start_voice_link().await {
        log::error!("Failed to start voice link: {}", e);
    }
    publish_status(&ui_bridge, &link).await;

    // 主事件循环：UI命令、链路状态、播放状态
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(cmd) = rx_ui.recv() => {
                log::info!("UI command: {:?}", cmd);
                match cmd {
                    UiCommand::Start => {
                        if let Err(e) = link.start_voice_link().await {
                            log::error!("Failed to start voice link: {}", e);
                        }
                    }
                    UiCommand::Stop => link.stop_voice_link(),
                }
            }

            Ok(()) = state_rx.changed() => {
                publish_status(&ui_bridge, &link).await;
            }

            Ok(()) = speaking_rx.changed() => {
                publish_status(&ui_bridge, &link).await;
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = ui_bridge.send_event(&event).await {
                            log::warn!("Failed to send event to UI: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => log::warn!("Missed {} link events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    link.stop_voice_link();
    Ok(())
}
