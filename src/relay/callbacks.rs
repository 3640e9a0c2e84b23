use crate::error::AppError;
use crate::models::flow::Phase;

/// Progress notifications from the engine to its caller (usually a UI).
///
/// Every method has a no-op default so callers only implement what they
/// render. Implementations are called from engine tasks and must not block.
pub trait FlowCallbacks: Send + Sync {
    fn on_phase_start(&self, _phase: Phase) {}

    fn on_model_start(&self, _kind: &str, _instance_id: Option<&str>) {}

    fn on_model_update(&self, _kind: &str, _partial_text: &str, _instance_id: Option<&str>) {}

    fn on_model_complete(&self, _kind: &str, _final_text: &str, _instance_id: Option<&str>) {}

    fn on_error(&self, _error: &AppError) {}

    fn on_conversation_link(&self, _instance_id: &str, _location: &str, _kind: Option<&str>) {}
}

/// Callbacks that ignore everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl FlowCallbacks for NoopCallbacks {}
