//! Registered command table
//!
//! Every tool the model may call is one [`ToolEntry`]: its declaration (name,
//! description, parameter schema), its gate, and exactly one handler. The
//! setup message advertises [`ToolRegistry::declarations`], so nothing can be
//! declared without a handler behind it.

use crate::devices::{DeviceAction, DeviceControl, DeviceError};
use crate::gemini::{FunctionDeclaration, ToolCallRequest};
use crate::media::{MediaError, MediaHub};
use crate::scenario::{ScenarioEngine, ScenarioStep};
use crate::view::{ActiveView, BookPage, Emotion, LineKind, MapMode, MapView, SharedView, ZoomDirection};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const VERIFY_SECRET_CODE: &str = "verify_secret_code";
pub const SET_EMOTION: &str = "set_emotion";

/// Default result for handlers that report nothing more specific.
pub const RESULT_SUCCESS: &str = "execution_success";
pub const RESULT_FAILED: &str = "execution_failed";
pub const RESULT_LOCKED: &str = "error_system_locked";

const DIGITAL_ZOOM_MAX: f32 = 5.0;
const DIGITAL_ZOOM_STEP: f32 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("handler panicked")]
    Panicked,
}

/// How the dispatcher gates a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Requires authorization and holds the busy flag.
    Authorized,
    /// The code check itself: never locked out, holds the busy flag.
    Verification,
    /// Cosmetic: bypasses both authorization and busy.
    Open,
}

/// Panel change applied before the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    Keep,
    Show(ActiveView),
    Dashboard,
}

/// What a handler reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: String,
    /// Grant authorization (only meaningful for the verification tool)
    pub authorize: bool,
    /// Timed follow-up lines played after the response is sent
    pub steps: Vec<ScenarioStep>,
}

impl ToolOutcome {
    pub fn done(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            authorize: false,
            steps: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::done(RESULT_SUCCESS)
    }

    pub fn then(mut self, step: ScenarioStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// Collaborators a handler may touch.
pub struct ToolContext {
    pub view: SharedView,
    pub media: Option<MediaHub>,
    pub devices: Arc<dyn DeviceControl>,
    pub scenario: Arc<dyn ScenarioEngine>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;

    fn target_view(&self, _call: &ToolCallRequest) -> ViewChange {
        ViewChange::Keep
    }
}

#[derive(Clone)]
pub struct ToolEntry {
    pub declaration: FunctionDeclaration,
    pub gate: Gate,
    pub handler: Arc<dyn ToolHandler>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool {0} is already registered")]
    Duplicate(String),
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        declaration: FunctionDeclaration,
        gate: Gate,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&declaration.name) {
            return Err(RegistryError::Duplicate(declaration.name));
        }
        self.entries.insert(
            declaration.name.clone(),
            ToolEntry {
                declaration,
                gate,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.entries.values().map(|e| e.declaration.clone()).collect()
    }

    /// The built-in command table, verifying codes against `secret`.
    pub fn builtin(secret: &str) -> Self {
        let mut registry = Self::new();
        let tools: Vec<(FunctionDeclaration, Gate, Arc<dyn ToolHandler>)> = vec![
            (
                declare(VERIFY_SECRET_CODE, None, object(json!({"code": {"type": "STRING"}}), &["code"])),
                Gate::Verification,
                Arc::new(VerifySecretCode { secret: secret.to_string() }),
            ),
            (
                declare(
                    SET_EMOTION,
                    Some("Changes your digital facial expression."),
                    object(
                        json!({"emotion": {"type": "STRING", "enum": Emotion::ALL.iter().map(|e| e.as_str()).collect::<Vec<_>>()}}),
                        &["emotion"],
                    ),
                ),
                Gate::Open,
                Arc::new(SetEmotion),
            ),
            (
                declare(
                    "switch_camera",
                    Some("Switches between front (user) and back (environment) cameras."),
                    object(json!({}), &[]),
                ),
                Gate::Authorized,
                Arc::new(SwitchCamera),
            ),
            (
                declare(
                    "navigate_back",
                    Some("Goes back to the main dashboard or closes the currently open application/tool."),
                    object(json!({}), &[]),
                ),
                Gate::Authorized,
                Arc::new(NavigateBack),
            ),
            (
                declare("control_camera_zoom", Some("Zooms the camera lens."), zoom_schema()),
                Gate::Authorized,
                Arc::new(CameraZoom),
            ),
            (
                declare(
                    "control_page_zoom",
                    Some("Zooms the text content of Books, Notes, or Code pages."),
                    zoom_schema(),
                ),
                Gate::Authorized,
                Arc::new(PageZoom),
            ),
            (
                declare(
                    "device_control",
                    Some("Controls hardware settings."),
                    object(
                        json!({"action": {"type": "STRING", "enum": ["lock", "volume_up", "volume_down", "brightness", "home", "flashlight"]}}),
                        &["action"],
                    ),
                ),
                Gate::Authorized,
                Arc::new(DeviceControlTool),
            ),
            (
                declare(
                    "toggle_map",
                    Some("Opens or closes the satellite map view, or navigates to a location."),
                    object(
                        json!({
                            "action": {"type": "STRING", "enum": ["open", "close", "navigate"]},
                            "location": {"type": "STRING", "description": "City or location name if navigating"}
                        }),
                        &["action"],
                    ),
                ),
                Gate::Authorized,
                Arc::new(ToggleMap),
            ),
            (
                declare(
                    "show_book_page",
                    Some("Displays a page from a book."),
                    object(
                        json!({
                            "title": {"type": "STRING", "description": "Title of the book"},
                            "author": {"type": "STRING", "description": "Author of the book"},
                            "content": {"type": "STRING", "description": "The exact text/paragraph from the book"},
                            "page_number": {"type": "STRING", "description": "Hypothetical page number"},
                            "language": {"type": "STRING", "description": "The language of the content"}
                        }),
                        &["title", "content"],
                    ),
                ),
                Gate::Authorized,
                Arc::new(ShowBookPage),
            ),
            (
                declare("close_book_page", Some("Closes the book page."), object(json!({}), &[])),
                Gate::Authorized,
                Arc::new(CloseBookPage),
            ),
            (
                declare(
                    "launch_app",
                    Some("Opens external apps or internal tools."),
                    object(
                        json!({"app_name": {"type": "STRING", "description": "Name of the app or terminal (e.g., cmd, powershell, python)"}}),
                        &["app_name"],
                    ),
                ),
                Gate::Authorized,
                Arc::new(ScenarioTool { view: launch_app_view }),
            ),
            (
                declare(
                    "execute_terminal_command",
                    Some("Executes a command in the active terminal."),
                    object(
                        json!({
                            "command": {"type": "STRING", "description": "The command to run"},
                            "output_type": {"type": "STRING", "enum": ["scan", "text", "error"]}
                        }),
                        &["command"],
                    ),
                ),
                Gate::Authorized,
                Arc::new(ScenarioTool { view: |_| ViewChange::Show(ActiveView::Shell) }),
            ),
            (
                declare(
                    "consult_doctor",
                    Some("Consults the internal medical module."),
                    object(
                        json!({
                            "symptoms": {"type": "STRING", "description": "The symptoms described"},
                            "diagnosis": {"type": "STRING", "description": "Medical diagnosis"},
                            "treatment": {"type": "STRING", "description": "List of medicines"},
                            "advice": {"type": "STRING", "description": "Additional advice"}
                        }),
                        &["symptoms", "diagnosis", "treatment"],
                    ),
                ),
                Gate::Authorized,
                Arc::new(ScenarioTool { view: |_| ViewChange::Show(ActiveView::MedBay) }),
            ),
        ];

        for (declaration, gate, handler) in tools {
            // Names above are distinct literals.
            let _ = registry.register(declaration, gate, handler);
        }
        registry
    }
}

pub fn declare(name: &str, description: Option<&str>, parameters: serde_json::Value) -> FunctionDeclaration {
    FunctionDeclaration {
        name: name.to_string(),
        description: description.map(str::to_string),
        parameters,
    }
}

fn object(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    json!({ "type": "OBJECT", "properties": properties, "required": required })
}

fn zoom_schema() -> serde_json::Value {
    object(json!({"direction": {"type": "STRING", "enum": ["in", "out", "reset"]}}), &["direction"])
}

fn zoom_direction(call: &ToolCallRequest) -> ZoomDirection {
    match call.arg_str("direction") {
        Some("in") => ZoomDirection::In,
        Some("out") => ZoomDirection::Out,
        _ => ZoomDirection::Reset,
    }
}

struct VerifySecretCode {
    secret: String,
}

#[async_trait]
impl ToolHandler for VerifySecretCode {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let code = match call.args.get("code") {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };

        // The welcome line is written by the dispatcher when the grant lands.
        if code == self.secret {
            Ok(ToolOutcome {
                authorize: true,
                ..ToolOutcome::done("authorized")
            })
        } else {
            ctx.view.update(|v| {
                v.emotion = Emotion::Angry;
                v.log(LineKind::Error, "ACCESS DENIED. INCORRECT KEY.");
            });
            Ok(ToolOutcome::done("denied"))
        }
    }
}

struct SetEmotion;

#[async_trait]
impl ToolHandler for SetEmotion {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        if let Some(emotion) = call.arg_str("emotion").and_then(Emotion::parse) {
            ctx.view.set_emotion(emotion);
        }
        Ok(ToolOutcome::done("emotion_updated"))
    }
}

struct SwitchCamera;

#[async_trait]
impl ToolHandler for SwitchCamera {
    async fn call(&self, _call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let media = ctx.media.as_ref().ok_or(MediaError::NoStream)?;
        let facing = media.switch_facing().await?;
        ctx.view.update(|v| {
            v.camera_zoom = 1.0;
            v.log(LineKind::System, format!("[OPTICS] CAMERA SWITCHED: {}", facing.as_str().to_uppercase()));
        });
        Ok(ToolOutcome::done("camera_switched"))
    }
}

struct NavigateBack;

#[async_trait]
impl ToolHandler for NavigateBack {
    async fn call(&self, _call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        ctx.view.update(|v| {
            v.clear_panels();
            v.emotion = Emotion::Neutral;
            v.log(LineKind::System, "RETURNING TO DASHBOARD...");
        });
        Ok(ToolOutcome::success())
    }

    fn target_view(&self, _call: &ToolCallRequest) -> ViewChange {
        ViewChange::Dashboard
    }
}

struct CameraZoom;

#[async_trait]
impl ToolHandler for CameraZoom {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let direction = zoom_direction(call);
        ctx.view.log(LineKind::System, format!("[OPTICS] INITIATING ZOOM: {:?}", direction).to_uppercase());

        let Some(stream) = ctx.media.as_ref().and_then(|m| m.current()).filter(|s| s.is_active()) else {
            ctx.view.log(LineKind::Error, "CAMERA NOT INITIALIZED");
            return Ok(ToolOutcome::success());
        };

        let current = ctx.view.update(|v| v.camera_zoom);
        if let Some((camera, range)) = stream.camera().and_then(|c| c.zoom_range().map(|r| (c, r))) {
            let step = range.step * 2.0;
            let level = match direction {
                ZoomDirection::In => (current + step).min(range.max),
                ZoomDirection::Out => (current - step).max(range.min),
                ZoomDirection::Reset => range.min,
            };
            if camera.set_zoom(level).is_ok() {
                ctx.view.update(|v| {
                    v.camera_zoom = level;
                    v.log(LineKind::Success, format!("[HARDWARE] ZOOM SET TO {:.1}x", level));
                });
                return Ok(ToolOutcome::success());
            }
        }

        let level = match direction {
            ZoomDirection::In => (current + DIGITAL_ZOOM_STEP).min(DIGITAL_ZOOM_MAX),
            ZoomDirection::Out => (current - DIGITAL_ZOOM_STEP).max(1.0),
            ZoomDirection::Reset => 1.0,
        };
        ctx.view.update(|v| {
            v.camera_zoom = level;
            v.log(LineKind::Warning, format!("[DIGITAL] ZOOM SET TO {:.1}x", level));
        });
        Ok(ToolOutcome::success())
    }
}

struct PageZoom;

#[async_trait]
impl ToolHandler for PageZoom {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let direction = zoom_direction(call);
        ctx.view.update(|v| {
            v.log(LineKind::System, format!("[UI] ADJUSTING CONTENT ZOOM: {:?}", direction).to_uppercase());
            v.zoom_content(direction);
            v.log(LineKind::Success, "[UI] ZOOM LEVEL ADJUSTED");
        });
        Ok(ToolOutcome::success())
    }
}

struct DeviceControlTool;

#[async_trait]
impl ToolHandler for DeviceControlTool {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let action: DeviceAction = serde_json::from_value(call.args.get("action").cloned().unwrap_or_default())
            .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        ctx.view.log(LineKind::System, format!("[HARDWARE] EXECUTING: {}", action.as_str().to_uppercase()));

        let torch = if action == DeviceAction::Flashlight {
            ctx.view.update(|v| !v.flashlight)
        } else {
            ctx.view.update(|v| v.flashlight)
        };
        ctx.devices.apply(action, torch).await?;
        ctx.view.update(|v| v.flashlight = torch);

        Ok(ToolOutcome::success().then(ScenarioStep::new(200, LineKind::Success, "[HARDWARE] COMMAND ACKNOWLEDGED.")))
    }
}

struct ToggleMap;

#[async_trait]
impl ToolHandler for ToggleMap {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        match call.arg_str("action") {
            Some("open") => ctx.view.update(|v| {
                v.active_view = Some(ActiveView::Map);
                v.emotion = Emotion::Thinking;
                v.map = Some(MapView {
                    target: call.arg_str("location").unwrap_or("current location").to_string(),
                    mode: MapMode::Satellite,
                    status: "live".to_string(),
                    zoom: 12,
                });
                v.log(LineKind::System, "[SATELLITE] MAP LINK OPEN.");
            }),
            Some("navigate") => {
                let target = call.arg_str("location").unwrap_or("Islamabad").to_string();
                ctx.view.update(|v| {
                    v.active_view = Some(ActiveView::Map);
                    v.emotion = Emotion::Happy;
                    v.log(LineKind::Warning, format!("[NAV] CONFIGURING ROUTE TO: {}", target.to_uppercase()));
                    v.map = Some(MapView {
                        target,
                        mode: MapMode::Navigation,
                        status: "locking".to_string(),
                        zoom: 14,
                    });
                });
            }
            _ => ctx.view.update(|v| {
                v.map = None;
                v.active_view = None;
                v.log(LineKind::System, "[SATELLITE] LINK TERMINATED.");
            }),
        }
        Ok(ToolOutcome::success())
    }

    fn target_view(&self, call: &ToolCallRequest) -> ViewChange {
        match call.arg_str("action") {
            Some("open") | Some("navigate") => ViewChange::Show(ActiveView::Map),
            Some("close") => ViewChange::Dashboard,
            _ => ViewChange::Keep,
        }
    }
}

struct ShowBookPage;

#[async_trait]
impl ToolHandler for ShowBookPage {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let arg = |key: &str, default: &str| call.arg_str(key).unwrap_or(default).to_string();
        let page = BookPage {
            title: arg("title", "Unknown Title"),
            author: arg("author", "Unknown Author"),
            content: arg("content", "Content Unavailable."),
            page_number: arg("page_number", "1"),
            language: arg("language", "English"),
        };
        let retrieved = format!("[SUCCESS] RETRIEVED: {} ({})", page.title, call.arg_str("language").unwrap_or("EN"));
        ctx.view.update(|v| {
            v.book = Some(page);
            v.emotion = Emotion::Thinking;
            v.log(LineKind::System, "[LIBRARY] ACCESSING DATABASE...");
        });
        Ok(ToolOutcome::success().then(ScenarioStep::new(300, LineKind::Success, retrieved)))
    }

    fn target_view(&self, _call: &ToolCallRequest) -> ViewChange {
        ViewChange::Show(ActiveView::Book)
    }
}

struct CloseBookPage;

#[async_trait]
impl ToolHandler for CloseBookPage {
    async fn call(&self, _call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        ctx.view.update(|v| {
            v.book = None;
            v.emotion = Emotion::Neutral;
            v.log(LineKind::System, "[LIBRARY] CLOSING ARCHIVE VIEW.");
        });
        Ok(ToolOutcome::success())
    }

    fn target_view(&self, _call: &ToolCallRequest) -> ViewChange {
        ViewChange::Dashboard
    }
}

/// A tool whose visible output comes entirely from the scenario engine.
pub struct ScenarioTool {
    pub view: fn(&ToolCallRequest) -> ViewChange,
}

#[async_trait]
impl ToolHandler for ScenarioTool {
    async fn call(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let plan = ctx.scenario.plan(&call.name, &call.args);
        ctx.view.update(|v| {
            if let Some(emotion) = plan.emotion {
                v.emotion = emotion;
            }
            if plan.panel.is_some() {
                v.panel = plan.panel.clone();
            }
        });
        Ok(ToolOutcome {
            result: plan.result.unwrap_or_else(|| RESULT_SUCCESS.to_string()),
            authorize: false,
            steps: plan.steps,
        })
    }

    fn target_view(&self, call: &ToolCallRequest) -> ViewChange {
        (self.view)(call)
    }
}

fn launch_app_view(call: &ToolCallRequest) -> ViewChange {
    let app = call.arg_str("app_name").unwrap_or_default().to_lowercase();
    if ["terminal", "shell", "cmd", "console"].iter().any(|k| app.contains(k)) {
        ViewChange::Show(ActiveView::Shell)
    } else if app.contains("note") || app.contains("editor") {
        ViewChange::Show(ActiveView::Notes)
    } else {
        ViewChange::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::LoggingDevice;
    use crate::media::testing::{FakeDevices, SolidCamera};
    use crate::media::{Camera, FacingMode, MediaStream, ZoomRange};
    use crate::scenario::PlainScenario;
    use std::collections::HashSet;

    fn context(media: Option<MediaHub>) -> ToolContext {
        ToolContext {
            view: SharedView::default(),
            media,
            devices: Arc::new(LoggingDevice::default()),
            scenario: Arc::new(PlainScenario),
        }
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::new("t1", name, args)
    }

    async fn run(registry: &ToolRegistry, ctx: &ToolContext, name: &str, args: serde_json::Value) -> ToolOutcome {
        registry.get(name).unwrap().handler.call(&call(name, args), ctx).await.unwrap()
    }

    #[test]
    fn test_every_declaration_has_one_handler() {
        let registry = ToolRegistry::builtin("07861");
        let names: Vec<_> = registry.declarations().into_iter().map(|d| d.name).collect();
        let unique: HashSet<_> = names.iter().cloned().collect();
        assert_eq!(names.len(), unique.len());
        assert_eq!(names.len(), registry.len());
        for name in &names {
            assert!(registry.get(name).is_some(), "{} has no handler", name);
        }
        assert_eq!(registry.get(VERIFY_SECRET_CODE).unwrap().gate, Gate::Verification);
        assert_eq!(registry.get(SET_EMOTION).unwrap().gate, Gate::Open);
        assert_eq!(registry.get("navigate_back").unwrap().gate, Gate::Authorized);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::builtin("07861");
        let err = registry.register(
            declare("navigate_back", None, object(json!({}), &[])),
            Gate::Authorized,
            Arc::new(NavigateBack),
        );
        assert!(matches!(err, Err(RegistryError::Duplicate(name)) if name == "navigate_back"));
    }

    #[tokio::test]
    async fn test_verify_code_accepts_trimmed_exact_match() {
        let registry = ToolRegistry::builtin("07861");
        let ctx = context(None);

        let outcome = run(&registry, &ctx, VERIFY_SECRET_CODE, json!({"code": " 07861 "})).await;
        assert_eq!(outcome.result, "authorized");
        assert!(outcome.authorize);

        let outcome = run(&registry, &ctx, VERIFY_SECRET_CODE, json!({"code": "7861"})).await;
        assert_eq!(outcome.result, "denied");
        assert!(!outcome.authorize);
        let view = ctx.view.snapshot();
        assert_eq!(view.emotion, Emotion::Angry);
        assert!(view.log.contains(LineKind::Error, "ACCESS DENIED"));
    }

    #[tokio::test]
    async fn test_set_emotion_ignores_unknown_values() {
        let registry = ToolRegistry::builtin("07861");
        let ctx = context(None);
        let outcome = run(&registry, &ctx, SET_EMOTION, json!({"emotion": "shy"})).await;
        assert_eq!(outcome.result, "emotion_updated");
        assert_eq!(ctx.view.snapshot().emotion, Emotion::Shy);

        run(&registry, &ctx, SET_EMOTION, json!({"emotion": "smug"})).await;
        assert_eq!(ctx.view.snapshot().emotion, Emotion::Shy);
    }

    #[tokio::test]
    async fn test_switch_camera_flips_facing() {
        let registry = ToolRegistry::builtin("07861");
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices, FacingMode::User);
        hub.ensure_stream().await.unwrap();
        let ctx = context(Some(hub.clone()));

        let outcome = run(&registry, &ctx, "switch_camera", json!({})).await;
        assert_eq!(outcome.result, "camera_switched");
        assert_eq!(hub.current().unwrap().facing(), FacingMode::Environment);
    }

    #[tokio::test]
    async fn test_camera_zoom_digital_and_hardware() {
        let registry = ToolRegistry::builtin("07861");
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices, FacingMode::User);
        hub.ensure_stream().await.unwrap();
        let ctx = context(Some(hub));

        for _ in 0..12 {
            run(&registry, &ctx, "control_camera_zoom", json!({"direction": "in"})).await;
        }
        assert_eq!(ctx.view.snapshot().camera_zoom, DIGITAL_ZOOM_MAX);
        run(&registry, &ctx, "control_camera_zoom", json!({"direction": "reset"})).await;
        assert_eq!(ctx.view.snapshot().camera_zoom, 1.0);

        // A camera with a zoom range is driven directly.
        let camera = Arc::new(SolidCamera {
            zoom: Some(ZoomRange { min: 1.0, max: 2.0, step: 0.25 }),
            ..SolidCamera::new([0, 0, 0])
        });
        let dyn_camera: Arc<dyn Camera> = camera.clone();
        let (stream, _tx) = MediaStream::new(FacingMode::User, Some(dyn_camera));
        let hw = HardwareOnly(Arc::new(stream));
        let hub = MediaHub::new(Arc::new(hw), FacingMode::User);
        hub.ensure_stream().await.unwrap();
        let ctx = context(Some(hub));
        run(&registry, &ctx, "control_camera_zoom", json!({"direction": "in"})).await;
        assert_eq!(*camera.zoom_level.lock().unwrap(), 1.5);
        assert!(ctx.view.snapshot().log.contains(LineKind::Success, "[HARDWARE] ZOOM SET TO 1.5x"));
    }

    /// Hands out one prepared stream.
    struct HardwareOnly(Arc<MediaStream>);

    #[async_trait]
    impl crate::media::MediaDevices for HardwareOnly {
        async fn acquire(&self, constraints: &crate::media::MediaConstraints) -> crate::media::Result<MediaStream> {
            let camera = self.0.camera().cloned();
            let (stream, _tx) = MediaStream::new(constraints.facing, camera);
            Ok(stream)
        }
    }

    #[tokio::test]
    async fn test_camera_zoom_without_stream() {
        let registry = ToolRegistry::builtin("07861");
        let ctx = context(None);
        run(&registry, &ctx, "control_camera_zoom", json!({"direction": "in"})).await;
        assert!(ctx.view.snapshot().log.contains(LineKind::Error, "CAMERA NOT INITIALIZED"));
    }

    #[tokio::test]
    async fn test_device_control_toggles_flashlight() {
        let registry = ToolRegistry::builtin("07861");
        let ctx = context(None);
        let outcome = run(&registry, &ctx, "device_control", json!({"action": "flashlight"})).await;
        assert!(ctx.view.snapshot().flashlight);
        assert_eq!(outcome.steps.len(), 1);
        run(&registry, &ctx, "device_control", json!({"action": "flashlight"})).await;
        assert!(!ctx.view.snapshot().flashlight);

        let err = registry
            .get("device_control")
            .unwrap()
            .handler
            .call(&call("device_control", json!({"action": "self_destruct"})), &ctx)
            .await;
        assert!(matches!(err, Err(ToolError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_map_and_book_panels() {
        let registry = ToolRegistry::builtin("07861");
        let ctx = context(None);

        run(&registry, &ctx, "toggle_map", json!({"action": "navigate"})).await;
        let view = ctx.view.snapshot();
        assert_eq!(view.active_view, Some(ActiveView::Map));
        assert_eq!(view.map.as_ref().unwrap().target, "Islamabad");
        assert_eq!(view.map.as_ref().unwrap().mode, MapMode::Navigation);

        run(&registry, &ctx, "show_book_page", json!({"title": "Dune", "content": "Fear is the mind-killer."})).await;
        let view = ctx.view.snapshot();
        assert_eq!(view.book.as_ref().unwrap().author, "Unknown Author");
        assert_eq!(view.book.as_ref().unwrap().language, "English");

        run(&registry, &ctx, "navigate_back", json!({})).await;
        let view = ctx.view.snapshot();
        assert!(view.book.is_none() && view.map.is_none() && view.active_view.is_none());
    }

    #[test]
    fn test_target_views() {
        let registry = ToolRegistry::builtin("07861");
        let view_of = |name: &str, args: serde_json::Value| registry.get(name).unwrap().handler.target_view(&call(name, args));
        assert_eq!(view_of("launch_app", json!({"app_name": "CMD"})), ViewChange::Show(ActiveView::Shell));
        assert_eq!(view_of("launch_app", json!({"app_name": "notepad"})), ViewChange::Show(ActiveView::Notes));
        assert_eq!(view_of("launch_app", json!({"app_name": "camera"})), ViewChange::Keep);
        assert_eq!(view_of("consult_doctor", json!({})), ViewChange::Show(ActiveView::MedBay));
        assert_eq!(view_of("toggle_map", json!({"action": "close"})), ViewChange::Dashboard);
        assert_eq!(view_of("close_book_page", json!({})), ViewChange::Dashboard);
    }

    #[tokio::test]
    async fn test_scenario_tool_forwards_plan() {
        let registry = ToolRegistry::builtin("07861");
        let ctx = context(None);
        let outcome = run(&registry, &ctx, "execute_terminal_command", json!({"command": "ls"})).await;
        assert_eq!(outcome.result, RESULT_SUCCESS);
        assert_eq!(outcome.steps.len(), 2);
    }
}
