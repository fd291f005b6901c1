//! Messages exchanged with the remote speech session.
//!
//! Outbound audio is either a `realtimeInput` JSON text message carrying
//! base64 PCM16, or a raw PCM16 binary message. Inbound audio arrives as raw
//! PCM16 binary messages or as `inlineData` parts of a `serverContent` model
//! turn. Everything else is not audio and is ignored here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::{AudioFrame, PlaybackBuffer, codec};
use crate::config::{Config, WireFormat};
use crate::error::DecodeError;

/// An inbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

/// An outbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

// ======================== Setup ========================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage {
    setup: Setup,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice {
    voice_name: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

/// First message on a fresh connection: model, audio response modality,
/// optional voice and system instruction.
pub fn setup_message(config: &Config) -> serde_json::Result<String> {
    let msg = SetupMessage {
        setup: Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: config.voice.as_ref().map(|voice| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
        },
    };
    serde_json::to_string(&msg)
}

// ======================== Outbound audio ========================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: &'a str,
}

/// Frame one captured frame for the wire.
pub fn encode_frame(frame: &AudioFrame, format: WireFormat) -> serde_json::Result<Outbound> {
    match format {
        WireFormat::Binary => Ok(Outbound::Binary(frame.to_bytes())),
        WireFormat::Json => {
            let mime_type = frame.mime_type();
            let data = frame.to_base64();
            let msg = RealtimeInputMessage {
                realtime_input: RealtimeInput {
                    media_chunks: [MediaChunk {
                        mime_type: &mime_type,
                        data: &data,
                    }],
                },
            };
            Ok(Outbound::Text(serde_json::to_string(&msg)?))
        }
    }
}

// ======================== Inbound audio ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    server_content: Option<ServerContent>,
    setup_complete: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    #[serde(default)]
    turn_complete: bool,
}

/// `rate=` parameter of an `audio/pcm` MIME type.
fn pcm_rate(mime_type: &str) -> Option<Option<u32>> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?;
    if !essence.eq_ignore_ascii_case("audio/pcm") && !essence.eq_ignore_ascii_case("audio/l16") {
        return None;
    }
    let rate = parts
        .filter_map(|p| p.strip_prefix("rate="))
        .find_map(|r| r.parse().ok());
    Some(rate)
}

/// Every audio chunk carried by `payload`, decoded, in message order.
///
/// Non-audio payloads yield nothing. Each malformed chunk yields its own
/// error so the caller can drop exactly that chunk.
pub fn extract_audio(
    payload: &Payload,
    output_rate: u32,
) -> Vec<Result<PlaybackBuffer, DecodeError>> {
    match payload {
        Payload::Binary(data) => vec![codec::decode(data, output_rate)],
        Payload::Text(text) => {
            let msg: ServerMessage = match serde_json::from_str(text) {
                Ok(msg) => msg,
                Err(_) => {
                    // 可能不是JSON，忽略
                    log::debug!("Ignoring non-JSON text message ({} bytes)", text.len());
                    return Vec::new();
                }
            };
            if msg.setup_complete.is_some() {
                log::debug!("Server setup complete");
            }
            let Some(content) = msg.server_content else {
                return Vec::new();
            };
            if content.turn_complete {
                log::debug!("Agent turn complete");
            }
            let Some(turn) = content.model_turn else {
                return Vec::new();
            };

            let mut chunks = Vec::new();
            for part in turn.parts {
                if let Some(text) = part.text {
                    log::debug!("Agent text: {}", text);
                }
                let Some(blob) = part.inline_data else {
                    continue;
                };
                let Some(rate) = pcm_rate(&blob.mime_type) else {
                    log::debug!("Ignoring inline data of type {}", blob.mime_type);
                    continue;
                };
                chunks.push(codec::decode_base64(&blob.data, rate.unwrap_or(output_rate)));
            }
            chunks
        }
    }
}
