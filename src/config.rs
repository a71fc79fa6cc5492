//! Session configuration
//!
//! Defaults cover every tunable; [`SessionConfig::from_env`] overrides the
//! ones that make sense per deployment.

use crate::gemini::{BidiGenerateContentSetup, FunctionDeclaration, GenerationConfig, Tool, DEFAULT_MODEL};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SECRET_CODE: &str = "07861";
pub const DEFAULT_LOCK_FILE: &str = "livelink_lock.json";
pub const DEFAULT_PROBE_HOST: &str = "generativelanguage.googleapis.com:443";

/// Captured samples per processing window.
pub const CAPTURE_WINDOW: usize = 4096;
/// Gain applied to captured samples before encoding.
pub const INPUT_GAIN: f32 = 1.2;

pub const FRESH_GREETING: &str = "The user has scanned their face. Ask for the secret code. Say: \
     'Biometric verified. Photo installed. Tell me the code to unlock the system.'";
pub const RECONNECT_GREETING: &str = "Just say: 'System reconnected. I am back.'";

pub const SYSTEM_INSTRUCTION: &str = "You are a high-tech AI assistant with a voice, a face and a camera.

BEHAVIOR:
- You can hear and see the user through the camera.
- If you see someone in the frame who is not the user, ask who is with them.
- Personality: loyal, fast, obedient, with a hacker's flair.
- The system starts locked. Ask for the unlock code and check it with verify_secret_code before using any other tool.
- Change your face with set_emotion whenever your mood changes.

TOOLS:
- Use the provided tools for maps, books, the terminal, medical advice and the device.
- If asked to open or close the map, use toggle_map.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub secret_code: String,
    pub reconnect_delay: Duration,
    pub video_interval: Duration,
    pub speaking_poll: Duration,
    pub lock_file: PathBuf,
    pub probe_host: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            secret_code: DEFAULT_SECRET_CODE.to_string(),
            reconnect_delay: Duration::from_millis(5000),
            video_interval: Duration::from_millis(3000),
            speaking_poll: Duration::from_millis(50),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            probe_host: DEFAULT_PROBE_HOST.to_string(),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.api_key = lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty());
        if let Some(model) = lookup("LIVELINK_MODEL") {
            config.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }
        if let Some(voice) = lookup("LIVELINK_VOICE") {
            config.voice = voice;
        }
        if let Some(delay) = millis(&lookup, "LIVELINK_RECONNECT_DELAY_MS") {
            config.reconnect_delay = delay;
        }
        if let Some(interval) = millis(&lookup, "LIVELINK_VIDEO_INTERVAL_MS") {
            config.video_interval = interval;
        }
        if let Some(path) = lookup("LIVELINK_LOCK_FILE") {
            config.lock_file = PathBuf::from(path);
        }
        config
    }

    /// Setup message advertising `declarations`.
    pub fn setup(&self, declarations: Vec<FunctionDeclaration>) -> BidiGenerateContentSetup {
        BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig::audio_with_voice(&self.voice)),
            system_instruction: None,
            tools: vec![Tool {
                function_declarations: declarations,
            }],
        }
        .with_system_instruction(&self.system_instruction)
    }

    pub fn greeting(reconnect: bool) -> &'static str {
        if reconnect {
            RECONNECT_GREETING
        } else {
            FRESH_GREETING
        }
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!("Ignoring {}={:?}: expected a positive number of milliseconds", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> SessionConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SessionConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert!(config.api_key.is_none());
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.video_interval, Duration::from_secs(3));
        assert_eq!(config.secret_code, "07861");
        assert_eq!(config.lock_file, PathBuf::from("livelink_lock.json"));
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("GEMINI_API_KEY", "k"),
            ("LIVELINK_MODEL", "gemini-live-test"),
            ("LIVELINK_VOICE", "Puck"),
            ("LIVELINK_RECONNECT_DELAY_MS", "250"),
            ("LIVELINK_VIDEO_INTERVAL_MS", "nonsense"),
        ]);
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert_eq!(config.model, "models/gemini-live-test");
        assert_eq!(config.voice, "Puck");
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.video_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_blank_api_key_is_missing() {
        assert!(config_from(&[("GEMINI_API_KEY", "  ")]).api_key.is_none());
    }

    #[test]
    fn test_setup_carries_tools_and_voice() {
        let config = SessionConfig::default();
        let declarations = vec![FunctionDeclaration {
            name: "navigate_back".to_string(),
            description: None,
            parameters: serde_json::json!({"type": "OBJECT", "properties": {}}),
        }];
        let json = serde_json::to_value(config.setup(declarations)).unwrap();
        assert_eq!(json["model"], DEFAULT_MODEL);
        assert_eq!(json["tools"][0]["functionDeclarations"][0]["name"], "navigate_back");
        assert_eq!(
            json["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert!(json["systemInstruction"]["parts"][0]["text"].as_str().unwrap().contains("verify_secret_code"));
    }
}
