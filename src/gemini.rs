//! Gemini Live API wire protocol
//!
//! Message types for the bidirectional streaming endpoint: session setup,
//! realtime media input, client text turns and tool call round-trips.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

impl GenerationConfig {
    /// Audio responses spoken with a prebuilt voice.
    pub fn audio_with_voice(voice: &str) -> Self {
        Self {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            })),
        }
    }
}

/// A callable function advertised to the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

impl BidiGenerateContentSetup {
    pub fn with_system_instruction(mut self, text: &str) -> Self {
        self.system_instruction = Some(serde_json::json!({ "parts": [{ "text": text }] }));
        self
    }
}

/// One base64 media blob in a realtime input message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    pub fn encode(mime_type: &str, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// A chunk of realtime input (audio/video)
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Function call requested by the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl ToolCallRequest {
    pub fn new(id: &str, name: &str, args: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    /// String argument, if present.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Result handed back for one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub result: String,
}

impl ToolCallResponse {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "functionResponses": [{
                "id": self.id,
                "name": self.name,
                "response": { "result": self.result }
            }]
        })
    }
}

/// Message sent from client to server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    ClientContent(serde_json::Value),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolCallResponse),
}

impl ClientMessage {
    /// A single complete user text turn.
    pub fn user_text(text: &str) -> Self {
        Self::ClientContent(serde_json::json!({
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": true
        }))
    }

    pub fn media(mime_type: &str, bytes: &[u8]) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk::encode(mime_type, bytes)],
        })
    }

    /// Serialize to the JSON text frame sent over the socket.
    pub fn to_json_string(&self) -> Result<String> {
        let value = match self {
            Self::Setup(setup) => serde_json::json!({ "setup": setup }),
            Self::ClientContent(content) => serde_json::json!({ "clientContent": content }),
            Self::RealtimeInput(input) => serde_json::json!({ "realtimeInput": input }),
            Self::ToolResponse(response) => serde_json::json!({ "toolResponse": response.to_json() }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Server -> client messages
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: serde_json::Value,
    },
    ToolCallCancellation {
        #[serde(rename = "toolCallCancellation")]
        tool_call_cancellation: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Missing API key")]
    MissingApiKey,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Setup has been completed
    SetupComplete,

    /// Raw PCM16 speech from the model
    AudioResponse(Vec<u8>),

    /// Text part of a model turn
    TextResponse(String),

    /// Model is requesting one or more function calls
    ToolCall(Vec<ToolCallRequest>),

    /// Model has cancelled function calls
    ToolCallCancellation(Vec<String>),

    /// Server will disconnect soon
    GoAway,
}

/// Parse one text frame into zero or more responses.
pub fn parse_server_message(text: &str) -> Result<Vec<ApiResponse>> {
    let message = serde_json::from_str::<ServerMessage>(text)?;

    let responses = match message {
        ServerMessage::SetupComplete { .. } => vec![ApiResponse::SetupComplete],
        ServerMessage::ServerContent { server_content } => handle_server_content(&server_content),
        ServerMessage::ToolCall { tool_call } => {
            let calls = tool_call
                .get("functionCalls")
                .cloned()
                .map(serde_json::from_value::<Vec<ToolCallRequest>>)
                .transpose()?
                .unwrap_or_default();
            vec![ApiResponse::ToolCall(calls)]
        }
        ServerMessage::ToolCallCancellation { tool_call_cancellation } => {
            let ids = tool_call_cancellation["ids"]
                .as_array()
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| id.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            vec![ApiResponse::ToolCallCancellation(ids)]
        }
        ServerMessage::GoAway { .. } => vec![ApiResponse::GoAway],
    };

    Ok(responses)
}

/// Extract audio and text parts from a model turn, in order.
fn handle_server_content(content: &serde_json::Value) -> Vec<ApiResponse> {
    let mut out = Vec::new();
    let Some(parts) = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(|p| p.as_array())
    else {
        return out;
    };

    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            out.push(ApiResponse::TextResponse(text.to_string()));
        } else if let Some(data) = part
            .get("inlineData")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.as_str())
        {
            match general_purpose::STANDARD.decode(data) {
                Ok(bytes) => out.push(ApiResponse::AudioResponse(bytes)),
                Err(e) => debug!("Dropping undecodable inline audio: {}", e),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> serde_json::Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_setup_serialization() {
        let setup = BidiGenerateContentSetup {
            model: DEFAULT_MODEL.to_string(),
            generation_config: Some(GenerationConfig::audio_with_voice("Kore")),
            tools: vec![Tool {
                function_declarations: vec![FunctionDeclaration {
                    name: "verify_secret_code".to_string(),
                    description: None,
                    parameters: serde_json::json!({"type": "OBJECT"}),
                }],
            }],
            ..Default::default()
        }
        .with_system_instruction("be brief");

        let json = parse(&ClientMessage::Setup(setup).to_json_string().unwrap());
        let setup = &json["setup"];
        assert_eq!(setup["model"], DEFAULT_MODEL);
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(setup["tools"][0]["functionDeclarations"][0]["name"], "verify_secret_code");
        assert!(setup["tools"][0]["functionDeclarations"][0].get("description").is_none());
    }

    #[test]
    fn test_realtime_and_content_serialization() {
        let json = parse(&ClientMessage::media("audio/pcm;rate=16000", &[1, 2, 3]).to_json_string().unwrap());
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], general_purpose::STANDARD.encode([1u8, 2, 3]));

        let json = parse(&ClientMessage::user_text("hello").to_json_string().unwrap());
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn test_tool_response_serialization() {
        let msg = ClientMessage::ToolResponse(ToolCallResponse {
            id: "call-1".to_string(),
            name: "verify_secret_code".to_string(),
            result: "authorized".to_string(),
        });
        let json = parse(&msg.to_json_string().unwrap());
        let resp = &json["toolResponse"]["functionResponses"][0];
        assert_eq!(resp["id"], "call-1");
        assert_eq!(resp["name"], "verify_secret_code");
        assert_eq!(resp["response"]["result"], "authorized");
    }

    #[test]
    fn test_parse_tool_call() {
        let text = serde_json::json!({
            "toolCall": {"functionCalls": [
                {"id": "a", "name": "set_emotion", "args": {"emotion": "happy"}},
                {"id": "b", "name": "navigate_back"}
            ]}
        })
        .to_string();

        let responses = parse_server_message(&text).unwrap();
        let ApiResponse::ToolCall(calls) = &responses[0] else {
            panic!("Unexpected response: {:?}", responses);
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arg_str("emotion"), Some("happy"));
        assert_eq!(calls[1].args, serde_json::json!({}));
    }

    #[test]
    fn test_parse_server_content_parts() {
        let data = general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        let text = serde_json::json!({
            "serverContent": {"modelTurn": {"parts": [
                {"text": "hi"},
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}},
                {"inlineData": {"data": "!!not base64!!"}}
            ]}}
        })
        .to_string();

        let responses = parse_server_message(&text).unwrap();
        assert_eq!(
            responses,
            vec![
                ApiResponse::TextResponse("hi".to_string()),
                ApiResponse::AudioResponse(vec![1, 2, 3, 4]),
            ]
        );
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete": {}}"#).unwrap(),
            vec![ApiResponse::SetupComplete]
        );
        assert_eq!(
            parse_server_message(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap(),
            vec![ApiResponse::GoAway]
        );
        assert_eq!(
            parse_server_message(r#"{"toolCallCancellation": {"ids": ["x", "y"]}}"#).unwrap(),
            vec![ApiResponse::ToolCallCancellation(vec!["x".into(), "y".into()])]
        );
        assert!(parse_server_message("not json").is_err());
    }
}
