//! Defines the JSON control-message protocol between a device and the gateway.
//!
//! Control messages share the text channel of the WebSocket; audio travels
//! as binary frames (see [`super::codec`]). Unknown message types are logged
//! and ignored rather than closing the connection, so newer firmware can
//! talk to an older gateway.

use serde::{Deserialize, Serialize};

/// Negotiated audio parameters, echoed back in the server hello.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioParams {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Frame duration in milliseconds.
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_format() -> String {
    "opus".to_string()
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_channels() -> u8 {
    1
}
fn default_frame_duration() -> u32 {
    60
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: default_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

/// Optional client feature flags from the hello message.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClientFeatures {
    #[serde(default)]
    pub mcp: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    Auto,
    Manual,
    Realtime,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerAction {
    Restart,
    UpdateConfig,
}

/// Messages sent from the device to the gateway.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the session and negotiates the binary protocol version. Must be
    /// the first control message.
    Hello {
        #[serde(default = "default_protocol_version")]
        version: u8,
        #[serde(default)]
        features: ClientFeatures,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    /// Drives utterance segmentation.
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Present on `detect`: a wake word or typed text that skips speech
        /// recognition entirely.
        #[serde(default)]
        text: Option<String>,
    },
    /// Cancels the in-flight turn.
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Out-of-band management commands forwarded by the backend.
    Server { action: ServerAction },
}

fn default_protocol_version() -> u8 {
    1
}

/// Messages sent from the gateway to the device.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to the client hello.
    Hello {
        session_id: String,
        version: u8,
        transport: String,
        audio_params: AudioParams,
    },
    /// Final transcript of the user's utterance.
    Stt { text: String },
    /// Emotion hint extracted from the start of the model's reply.
    Llm { emotion: String },
    /// Playback framing around synthesized audio.
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Asks the user to bind the device with the given code.
    Bind { code: String },
    /// Acknowledges a `server` command.
    Server { action: ServerAction },
    /// Reports a fatal error to the device.
    Error { message: String },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_with_sparse_fields_uses_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "hello"}"#).unwrap();
        match msg {
            ClientMessage::Hello {
                version,
                features,
                transport,
                audio_params,
            } => {
                assert_eq!(version, 1);
                assert!(!features.mcp);
                assert_eq!(transport, None);
                assert_eq!(audio_params, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn hello_with_full_audio_params() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "hello", "version": 3, "features": {"mcp": true},
                "transport": "websocket",
                "audio_params": {"format": "opus", "sample_rate": 24000,
                                 "channels": 1, "frame_duration": 20}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Hello {
                version,
                features,
                audio_params,
                ..
            } => {
                assert_eq!(version, 3);
                assert!(features.mcp);
                assert_eq!(audio_params.unwrap().sample_rate, 24000);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn listen_detect_carries_text() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "listen", "state": "detect", "text": "hey murmur"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Listen {
                state: ListenState::Detect,
                mode: None,
                text: Some("hey murmur".to_string()),
            }
        );
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        // The session logs and ignores these instead of closing.
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "selfie"}"#).is_err());
    }

    #[test]
    fn tts_states_serialize_snake_case() {
        let msg = ServerMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some("hello there".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"tts","state":"sentence_start","text":"hello there"}"#
        );

        let stop = ServerMessage::Tts {
            state: TtsState::Stop,
            text: None,
        };
        assert_eq!(
            serde_json::to_string(&stop).unwrap(),
            r#"{"type":"tts","state":"stop"}"#
        );
    }

    #[test]
    fn server_hello_round_trips_the_negotiated_params() {
        let msg = ServerMessage::Hello {
            session_id: "ab12".to_string(),
            version: 2,
            transport: "websocket".to_string(),
            audio_params: AudioParams::default(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"hello""#));
        assert!(json.contains(r#""version":2"#));
        assert!(json.contains(r#""sample_rate":16000"#));
    }
}
