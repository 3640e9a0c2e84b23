use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::models::flow::{Phase, SlaveStatus};
use crate::relay::dispatch::{Delivery, Settlement};
use crate::relay::registry::ForcedExchange;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tokens handed to the running flow.
#[derive(Debug, Clone)]
pub struct RunTokens {
    pub cancel: CancellationToken,
    /// Fired by a skip during Executing.
    pub skip: CancellationToken,
}

/// A slave result recorded during Executing.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedResult {
    pub status: SlaveStatus,
    pub text: String,
}

impl From<Delivery> for CollectedResult {
    fn from(delivery: Delivery) -> Self {
        let status = match delivery.settlement {
            Settlement::Completed => SlaveStatus::Completed,
            Settlement::Failed => SlaveStatus::Failed,
            Settlement::Forced => SlaveStatus::Skipped,
        };
        Self { status, text: delivery.text }
    }
}

/// Transient state of the single flow an orchestrator may run.
pub struct FlowState {
    /// Current phase; anything but Idle means a flow is active
    pub phase: Arc<Mutex<Phase>>,
    pub run_tokens: Arc<Mutex<Option<RunTokens>>>,
    /// Best texts force-completed by a skip, keyed by instance id
    pub skipped: Arc<Mutex<HashMap<String, String>>>,
    /// Settled slave results keyed by instance id
    pub collected: Arc<Mutex<HashMap<String, CollectedResult>>>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowState {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase::Idle)),
            run_tokens: Arc::new(Mutex::new(None)),
            skipped: Arc::new(Mutex::new(HashMap::new())),
            collected: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim the orchestrator for a new flow. Fails with `FlowBusy` when a
    /// flow is already active.
    pub fn begin_flow(&self) -> AppResult<RunTokens> {
        let mut phase = lock(&self.phase);
        if *phase != Phase::Idle {
            return Err(AppError::FlowBusy);
        }
        *phase = Phase::Planning;

        let tokens = RunTokens {
            cancel: CancellationToken::new(),
            skip: CancellationToken::new(),
        };
        *lock(&self.run_tokens) = Some(tokens.clone());
        lock(&self.skipped).clear();
        lock(&self.collected).clear();
        Ok(tokens)
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, next: Phase) {
        *lock(&self.phase) = next;
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.run_tokens)
            .as_ref()
            .is_some_and(|tokens| tokens.cancel.is_cancelled())
    }

    /// Cancel the active flow. Returns false when no flow is running.
    pub fn cancel(&self) -> bool {
        match lock(&self.run_tokens).as_ref() {
            Some(tokens) => {
                tokens.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remember force-completed texts and wake the Executing loop. Nothing
    /// happens when no exchange was forced.
    pub fn request_skip(&self, forced: &[ForcedExchange]) {
        if forced.is_empty() {
            return;
        }
        {
            let mut skipped = lock(&self.skipped);
            for exchange in forced {
                skipped.insert(exchange.instance_id.clone(), exchange.text.clone());
            }
        }
        if let Some(tokens) = lock(&self.run_tokens).as_ref() {
            tokens.skip.cancel();
        }
    }

    pub fn skipped_text(&self, instance_id: &str) -> Option<String> {
        lock(&self.skipped).get(instance_id).cloned()
    }

    pub fn record_result(&self, instance_id: &str, result: CollectedResult) {
        lock(&self.collected).insert(instance_id.to_string(), result);
    }

    pub fn take_result(&self, instance_id: &str) -> Option<CollectedResult> {
        lock(&self.collected).remove(instance_id)
    }

    /// Back to Idle with all per-run state cleared.
    pub fn reset(&self) {
        *lock(&self.run_tokens) = None;
        lock(&self.skipped).clear();
        lock(&self.collected).clear();
        *lock(&self.phase) = Phase::Idle;
    }
}

// Manual Clone so spawned tasks share the same state
impl Clone for FlowState {
    fn clone(&self) -> Self {
        Self {
            phase: Arc::clone(&self.phase),
            run_tokens: Arc::clone(&self.run_tokens),
            skipped: Arc::clone(&self.skipped),
            collected: Arc::clone(&self.collected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_flow_rejects_second_run() {
        let state = FlowState::new();
        state.begin_flow().expect("first run starts");
        assert_eq!(state.phase(), Phase::Planning);
        assert!(matches!(state.begin_flow(), Err(AppError::FlowBusy)));

        state.reset();
        assert_eq!(state.phase(), Phase::Idle);
        state.begin_flow().expect("starts again after reset");
    }

    #[test]
    fn test_cancel_without_flow_is_noop() {
        let state = FlowState::new();
        assert!(!state.cancel());
        assert!(!state.is_cancelled());
    }

    #[test]
    fn test_request_skip_records_texts_and_fires_token() {
        let state = FlowState::new();
        let tokens = state.begin_flow().expect("run starts");
        state.request_skip(&[ForcedExchange {
            request_id: "r1".into(),
            instance_id: "slot-2".into(),
            kind: "gpt".into(),
            text: "partial".into(),
        }]);
        assert!(tokens.skip.is_cancelled());
        assert!(!tokens.cancel.is_cancelled());
        assert_eq!(state.skipped_text("slot-2").as_deref(), Some("partial"));

        state.reset();
        assert_eq!(state.skipped_text("slot-2"), None);
    }

    #[test]
    fn test_request_skip_without_forced_exchanges_is_noop() {
        let state = FlowState::new();
        let tokens = state.begin_flow().expect("run starts");
        state.request_skip(&[]);
        assert!(!tokens.skip.is_cancelled());
    }

    #[test]
    fn test_collected_result_maps_settlement() {
        let result = CollectedResult::from(Delivery::forced("half"));
        assert_eq!(result.status, SlaveStatus::Skipped);
        assert_eq!(result.text, "half");
    }
}
