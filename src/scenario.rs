//! Narrative output seam for tools that only simulate work.
//!
//! A [`ScenarioEngine`] turns a tool call into a plan: timed status lines,
//! an optional emotion, optional panel data and an optional result string.
//! The dispatcher plays the plan; it never interprets the content.

use crate::view::{Emotion, LineKind};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioStep {
    /// Wait before emitting this line, relative to the previous step.
    pub delay: Duration,
    pub kind: LineKind,
    pub text: String,
}

impl ScenarioStep {
    pub fn new(delay_ms: u64, kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            kind,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scenario {
    pub result: Option<String>,
    pub emotion: Option<Emotion>,
    pub panel: Option<serde_json::Value>,
    pub steps: Vec<ScenarioStep>,
}

pub trait ScenarioEngine: Send + Sync {
    fn plan(&self, tool: &str, args: &serde_json::Value) -> Scenario;
}

/// Echoes the call back as a system line followed by an acknowledgement.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainScenario;

impl ScenarioEngine for PlainScenario {
    fn plan(&self, tool: &str, args: &serde_json::Value) -> Scenario {
        let detail = args
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| match v.as_str() {
                        Some(s) => format!("{}={}", k, s),
                        None => format!("{}={}", k, v),
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        Scenario {
            steps: vec![
                ScenarioStep::new(0, LineKind::System, format!("[EXEC] {} {}", tool.to_uppercase(), detail).trim_end().to_string()),
                ScenarioStep::new(200, LineKind::Success, "[EXEC] COMMAND ACKNOWLEDGED."),
            ],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_scenario_echoes_call() {
        let plan = PlainScenario.plan("launch_app", &serde_json::json!({"app_name": "notes"}));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].text, "[EXEC] LAUNCH_APP app_name=notes");
        assert_eq!(plan.steps[1].delay, Duration::from_millis(200));
        assert!(plan.result.is_none());
    }
}
