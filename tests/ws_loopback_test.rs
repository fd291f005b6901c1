use std::time::Duration;

use bytes::Bytes;
use fleet_radio::protocol::Payload;
use fleet_radio::{Config, LinkError, NetEvent, SpeechEndpoint, WsEndpoint};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

async fn next_event(rx: &mut mpsc::Receiver<NetEvent>) -> NetEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

fn config_for(url: String) -> Config {
    let mut config = Config::default();
    config.ws_url = url;
    config.model = "models/loopback".into();
    config
}

#[tokio::test]
async fn websocket_link_exchanges_setup_audio_and_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let setup = ws.next().await.unwrap().unwrap();
        let setup: Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();

        ws.send(Message::Binary(vec![0u8, 0, 1, 0].into()))
            .await
            .unwrap();
        let from_client = ws.next().await.unwrap().unwrap();

        ws.close(None).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
        (setup, from_client)
    });

    let config = config_for(format!("ws://{addr}/live"));
    let (tx, mut rx) = mpsc::channel(16);
    let handle = WsEndpoint.connect(&config, tx).await.unwrap();

    assert_eq!(next_event(&mut rx).await, NetEvent::Open);
    assert_eq!(
        next_event(&mut rx).await,
        NetEvent::Message(Payload::Binary(Bytes::from_static(&[0, 0, 1, 0])))
    );
    assert!(handle.send_binary(vec![7, 0]));
    assert_eq!(next_event(&mut rx).await, NetEvent::Closed);

    let (setup, from_client) = server.await.unwrap();
    assert_eq!(setup["setup"]["model"], "models/loopback");
    assert_eq!(
        setup["setup"]["generationConfig"]["responseModalities"][0],
        "AUDIO"
    );
    assert_eq!(from_client.into_data().to_vec(), vec![7, 0]);
}

#[tokio::test]
async fn local_close_does_not_report_remote_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut saw_close = false;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                saw_close = true;
            }
        }
        saw_close
    });

    let config = config_for(format!("ws://{addr}/live"));
    let (tx, mut rx) = mpsc::channel(16);
    let handle = WsEndpoint.connect(&config, tx).await.unwrap();
    assert_eq!(next_event(&mut rx).await, NetEvent::Open);

    handle.close();
    handle.close();
    assert!(handle.is_closed());
    assert!(server.await.unwrap());
    // the link task ends without a Closed or Error event
    assert!(
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn unreachable_server_reports_error_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = config_for(format!("ws://{addr}/live"));
    let (tx, mut rx) = mpsc::channel(16);
    let _handle = WsEndpoint.connect(&config, tx).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, NetEvent::Error(_)));
}

#[tokio::test]
async fn malformed_url_fails_synchronously() {
    let config = config_for("http://127.0.0.1:1/live".into());
    let (tx, _rx) = mpsc::channel(16);
    let err = WsEndpoint.connect(&config, tx).await.unwrap_err();
    assert!(matches!(err, LinkError::Connection(_)));
}
