//! Session-visible state that tool handlers and the session loop update:
//! emotional indicator, active view, panels, zoom levels and the user log.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Lines kept in the session log.
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Angry,
    Sad,
    Surprised,
    Love,
    Thinking,
    Laughing,
    Crying,
    Upset,
    Shy,
}

impl Emotion {
    pub const ALL: [Emotion; 11] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Angry,
        Emotion::Sad,
        Emotion::Surprised,
        Emotion::Love,
        Emotion::Thinking,
        Emotion::Laughing,
        Emotion::Crying,
        Emotion::Upset,
        Emotion::Shy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Happy => "happy",
            Self::Angry => "angry",
            Self::Sad => "sad",
            Self::Surprised => "surprised",
            Self::Love => "love",
            Self::Thinking => "thinking",
            Self::Laughing => "laughing",
            Self::Crying => "crying",
            Self::Upset => "upset",
            Self::Shy => "shy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

/// Which panel occupies the main area. `None` in [`SessionView`] is the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActiveView {
    Shell,
    Notes,
    Book,
    MedBay,
    Map,
    Osint,
    Sigint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Success,
    Error,
    Warning,
    System,
    Info,
    Medical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub id: u32,
    pub timestamp: String,
    pub kind: LineKind,
    pub text: String,
}

/// Bounded user-facing log, newest last.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    lines: VecDeque<LogLine>,
    /// Lines ever pushed, including evicted ones.
    pushed: u64,
}

impl SessionLog {
    pub fn push(&mut self, kind: LineKind, text: impl Into<String>) {
        self.pushed += 1;
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            id: rand::random(),
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            kind,
            text: text.into(),
        });
    }

    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Retained lines pushed after the first `seen` lines.
    pub fn since(&self, seen: u64) -> impl Iterator<Item = &LogLine> {
        let newer = self.pushed.saturating_sub(seen).min(self.lines.len() as u64) as usize;
        self.lines.iter().skip(self.lines.len() - newer)
    }

    pub fn last(&self) -> Option<&LogLine> {
        self.lines.back()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn contains(&self, kind: LineKind, needle: &str) -> bool {
        self.lines.iter().any(|l| l.kind == kind && l.text.contains(needle))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookPage {
    pub title: String,
    pub author: String,
    pub content: String,
    pub page_number: String,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MapMode {
    Satellite,
    Navigation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub target: String,
    pub mode: MapMode,
    pub status: String,
    pub zoom: u8,
}

/// Connection banner shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Banner {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub const CONTENT_ZOOM_MIN: f32 = 0.5;
pub const CONTENT_ZOOM_MAX: f32 = 3.0;
pub const CONTENT_ZOOM_STEP: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct SessionView {
    pub emotion: Emotion,
    pub active_view: Option<ActiveView>,
    pub banner: Banner,
    pub locked_overlay: bool,
    pub content_zoom: f32,
    pub camera_zoom: f32,
    pub flashlight: bool,
    pub book: Option<BookPage>,
    pub map: Option<MapView>,
    /// Opaque panel data produced by a scenario
    pub panel: Option<serde_json::Value>,
    pub log: SessionLog,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            emotion: Emotion::Neutral,
            active_view: None,
            banner: Banner::Disconnected,
            locked_overlay: true,
            content_zoom: 1.0,
            camera_zoom: 1.0,
            flashlight: false,
            book: None,
            map: None,
            panel: None,
            log: SessionLog::default(),
        }
    }
}

impl SessionView {
    pub fn log(&mut self, kind: LineKind, text: impl Into<String>) {
        self.log.push(kind, text);
    }

    /// Close whatever panel is open and return to the dashboard.
    pub fn clear_panels(&mut self) {
        self.active_view = None;
        self.book = None;
        self.map = None;
        self.panel = None;
    }

    /// Full reset after the user ends the session. The log survives.
    pub fn reset_for_abort(&mut self) {
        self.clear_panels();
        self.emotion = Emotion::Neutral;
        self.content_zoom = 1.0;
        self.camera_zoom = 1.0;
        self.flashlight = false;
        self.banner = Banner::Disconnected;
    }

    pub fn zoom_content(&mut self, direction: ZoomDirection) -> f32 {
        self.content_zoom = match direction {
            ZoomDirection::In => (self.content_zoom + CONTENT_ZOOM_STEP).min(CONTENT_ZOOM_MAX),
            ZoomDirection::Out => (self.content_zoom - CONTENT_ZOOM_STEP).max(CONTENT_ZOOM_MIN),
            ZoomDirection::Reset => 1.0,
        };
        self.content_zoom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoomDirection {
    In,
    Out,
    Reset,
}

/// View state shared between the session loop and tool handlers.
#[derive(Debug, Clone, Default)]
pub struct SharedView(Arc<Mutex<SessionView>>);

impl SharedView {
    pub fn new(view: SessionView) -> Self {
        Self(Arc::new(Mutex::new(view)))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SessionView) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn snapshot(&self) -> SessionView {
        self.update(|v| v.clone())
    }

    pub fn log(&self, kind: LineKind, text: impl Into<String>) {
        self.update(|v| v.log(kind, text));
    }

    pub fn set_emotion(&self, emotion: Emotion) {
        self.update(|v| v.emotion = emotion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_keeps_last_hundred() {
        let mut log = SessionLog::default();
        for i in 0..150 {
            log.push(LineKind::System, format!("line {}", i));
        }
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log.lines().next().unwrap().text, "line 50");
        assert_eq!(log.last().unwrap().text, "line 149");
    }

    #[test]
    fn test_since_survives_eviction() {
        let mut log = SessionLog::default();
        for i in 0..10 {
            log.push(LineKind::Info, format!("line {}", i));
        }
        let seen = log.pushed();
        assert_eq!(log.since(seen).count(), 0);
        assert_eq!(log.since(7).map(|l| l.text.as_str()).collect::<Vec<_>>(), ["line 7", "line 8", "line 9"]);

        for i in 10..160 {
            log.push(LineKind::Info, format!("line {}", i));
        }
        let newer: Vec<_> = log.since(seen).collect();
        assert_eq!(newer.len(), LOG_CAPACITY);
        assert_eq!(newer[0].text, "line 60");
        assert_eq!(log.since(150).count(), 10);
    }

    #[test]
    fn test_emotion_parse() {
        assert_eq!(Emotion::parse("love"), Some(Emotion::Love));
        assert_eq!(Emotion::parse("furious"), None);
        for e in Emotion::ALL {
            assert_eq!(Emotion::parse(e.as_str()), Some(e));
        }
    }

    #[test]
    fn test_content_zoom_bounds() {
        let mut view = SessionView::default();
        for _ in 0..20 {
            view.zoom_content(ZoomDirection::In);
        }
        assert_eq!(view.content_zoom, CONTENT_ZOOM_MAX);
        for _ in 0..20 {
            view.zoom_content(ZoomDirection::Out);
        }
        assert_eq!(view.content_zoom, CONTENT_ZOOM_MIN);
        assert_eq!(view.zoom_content(ZoomDirection::Reset), 1.0);
    }

    #[test]
    fn test_abort_reset_clears_view_but_keeps_log() {
        let mut view = SessionView::default();
        view.active_view = Some(ActiveView::Map);
        view.emotion = Emotion::Angry;
        view.log(LineKind::Error, "boom");
        view.reset_for_abort();
        assert_eq!(view.active_view, None);
        assert_eq!(view.emotion, Emotion::Neutral);
        assert_eq!(view.log.len(), 1);
    }
}
