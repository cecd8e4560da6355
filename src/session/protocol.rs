//! Wire envelopes for the provider's bidirectional streaming session.
//!
//! Only the parts this subsystem uses are modelled: the setup message,
//! realtime audio input, and the audio/interruption/turn fields of server
//! content. Everything else in an inbound message is ignored.

use serde::{Deserialize, Serialize};

use crate::audio::capture::AudioFrame;
use crate::error::{LiveError, Result};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on the socket: model, voice and persona.
    Setup(Setup),
    /// Streaming microphone audio.
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap one captured frame as realtime input.
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: frame.mime_type.clone(),
                data: frame.data.clone(),
            }],
        })
    }
}

/// Session negotiation payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

impl Setup {
    /// Audio-only replies spoken with the prebuilt `voice_name`.
    pub fn audio_reply(model: &str, voice_name: &str, system_instruction: &str) -> Self {
        Self {
            model: model.to_owned(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_owned()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_owned(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction.to_owned(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Inline media: base64 `data` tagged with `mime_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    inline_data: Option<Blob>,
}

/// Events extracted from one inbound message, in the order they apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server accepted the setup message.
    SetupComplete,
    /// One reply audio chunk (base64 int16 PCM).
    AudioChunk { mime_type: String, data: String },
    /// The user started speaking over the reply.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The server will close the connection soon.
    GoAway,
}

/// Parse an inbound JSON message into the events this subsystem handles.
///
/// Audio chunks come first, then the interruption flag, then turn completion.
///
/// # Errors
///
/// Returns [`LiveError::Decode`] if `text` is not a JSON object.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let msg: ServerMessage =
        serde_json::from_str(text).map_err(|e| LiveError::Decode(format!("server message: {e}")))?;

    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }
    if let Some(content) = msg.server_content {
        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|blob| blob.mime_type.starts_with("audio/") && !blob.data.is_empty())
                    .map(|blob| ServerEvent::AudioChunk {
                        mime_type: blob.mime_type,
                        data: blob.data,
                    }),
            );
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }
    if msg.go_away.is_some() {
        events.push(ServerEvent::GoAway);
    }
    Ok(events)
}
