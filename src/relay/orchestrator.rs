//! The three-phase planner/slave flow.
//!
//! A flow plans with the main brain, fans the parsed tasks out to the slaves
//! concurrently, then hands every slave's answer back to the main brain for
//! synthesis. Skip and cancel are driven from outside through the pending
//! registry and the run's tokens.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use crate::models::flow::{FlowMember, FlowOutcome, FlowPrompts, FlowReport, Phase, SlaveOutcome, SlaveStatus};
use crate::models::responder::Responder;
use crate::relay::callbacks::FlowCallbacks;
use crate::relay::dispatch::{error_text, Delivery, Dispatcher};
use crate::relay::parser::{self, TaskMap};
use crate::relay::registry::PendingRegistry;
use crate::state::{CollectedResult, FlowState, RunTokens};

/// Result text for a slave the planner gave nothing to do.
pub fn unassigned_text(alias: &str) -> String {
    format!("[Error] No instructions were assigned to {alias} by the planner.")
}

/// One `[<alias> Response]` block per slave, in roster order.
pub fn render_responses(outcomes: &[SlaveOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("[{} Response]\n{}\n", o.alias, o.text))
        .collect()
}

/// Resets the flow state however `run_flow` exits, including when its
/// future is dropped mid-run.
struct RunGuard<'a> {
    state: &'a FlowState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.reset();
    }
}

pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    state: FlowState,
}

impl Orchestrator {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            state: FlowState::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn registry(&self) -> &PendingRegistry {
        self.dispatcher.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        self.dispatcher.config()
    }

    /// Run one full flow and resolve once it is back to Idle.
    ///
    /// Failures inside the run are reported through `on_error` and come back
    /// as `FlowOutcome::Failed`. The `Err` cases are requests that never
    /// started a run.
    pub async fn run_flow(
        &self,
        goal: &str,
        main_brain: Responder,
        slaves: Vec<Responder>,
        prompts: &FlowPrompts,
        callbacks: Arc<dyn FlowCallbacks>,
    ) -> AppResult<FlowOutcome> {
        if slaves.is_empty() {
            return Err(AppError::InvalidRequest("A flow needs at least one slave".into()));
        }
        prompts.validate()?;

        let run = self.state.begin_flow()?;
        let _guard = RunGuard { state: &self.state };

        let members = parser::assign_aliases(dedup_slaves(slaves));
        log::info!(
            "Starting flow with main brain {} and {} slaves",
            main_brain.instance_id,
            members.len()
        );

        let result = self
            .run_flow_inner(goal, &main_brain, &members, prompts, &callbacks, &run)
            .await;

        let outcome = match result {
            Ok(report) => {
                log::info!("Flow completed ({} slaves)", report.outcomes.len());
                FlowOutcome::Completed(report)
            }
            Err(_) if run.cancel.is_cancelled() => {
                log::info!("Flow cancelled");
                FlowOutcome::Cancelled
            }
            Err(AppError::Cancelled) => FlowOutcome::Cancelled,
            Err(e) => {
                log::error!("Flow failed: {}", e);
                callbacks.on_error(&e);
                FlowOutcome::Failed(e)
            }
        };
        Ok(outcome)
    }

    async fn run_flow_inner(
        &self,
        goal: &str,
        main_brain: &Responder,
        members: &[FlowMember],
        prompts: &FlowPrompts,
        callbacks: &Arc<dyn FlowCallbacks>,
        run: &RunTokens,
    ) -> AppResult<FlowReport> {
        // 1. Planning
        self.enter_phase(Phase::Planning, callbacks.as_ref(), run)?;
        let roster = parser::render_roster(members);
        let planning_prompt = prompts.render_planning(&roster, goal);
        let plan = self
            .dispatch_guarded(main_brain, &planning_prompt, callbacks.as_ref(), &run.cancel)
            .await?
            .text;

        let minimum = self.config().min_plan_chars;
        let length = plan.trim().chars().count();
        if length < minimum {
            return Err(AppError::PlanTooShort { length, minimum });
        }
        if !parser::contains_task_marker(&plan) {
            log::warn!("Plan has no task markers; slaves will get no instructions");
        }

        // 2. Executing
        self.enter_phase(Phase::Executing, callbacks.as_ref(), run)?;
        let tasks = parser::parse_plan(&plan, members);
        if tasks.is_empty() {
            let err = AppError::NoTasksParsed;
            log::warn!("{}", err);
            callbacks.on_error(&err);
        }
        let outcomes = self.execute_slaves(members, &tasks, callbacks, run).await?;

        // 3. Synthesizing
        self.enter_phase(Phase::Synthesizing, callbacks.as_ref(), run)?;
        let synthesis_prompt = prompts.render_synthesis(goal, &render_responses(&outcomes));
        let synthesis = self
            .dispatch_guarded(main_brain, &synthesis_prompt, callbacks.as_ref(), &run.cancel)
            .await?
            .text;

        Ok(FlowReport {
            goal: goal.to_string(),
            plan,
            outcomes,
            synthesis,
        })
    }

    fn enter_phase(&self, phase: Phase, callbacks: &dyn FlowCallbacks, run: &RunTokens) -> AppResult<()> {
        if run.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.state.set_phase(phase);
        log::info!("Phase {} ({})", phase.number(), phase);
        callbacks.on_phase_start(phase);
        Ok(())
    }

    async fn dispatch_guarded(
        &self,
        responder: &Responder,
        text: &str,
        callbacks: &dyn FlowCallbacks,
        cancel: &CancellationToken,
    ) -> AppResult<Delivery> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            delivery = self.dispatcher.dispatch(responder, text, callbacks) => delivery,
        }
    }

    async fn execute_slaves(
        &self,
        members: &[FlowMember],
        tasks: &TaskMap,
        callbacks: &Arc<dyn FlowCallbacks>,
        run: &RunTokens,
    ) -> AppResult<Vec<SlaveOutcome>> {
        let mut join_set = JoinSet::new();

        for member in members {
            let instance_id = member.responder.instance_id.as_str();
            let Some((key, instructions)) = parser::resolve_instructions(tasks, member) else {
                log::warn!("No instructions for {} ({})", member.alias, instance_id);
                self.state.record_result(
                    instance_id,
                    CollectedResult {
                        status: SlaveStatus::Unassigned,
                        text: unassigned_text(&member.alias),
                    },
                );
                continue;
            };
            if run.cancel.is_cancelled() {
                join_set.abort_all();
                return Err(AppError::Cancelled);
            }
            log::debug!("Instructions for {} matched by {:?}", member.alias, key);

            let dispatcher = Arc::clone(&self.dispatcher);
            let callbacks = Arc::clone(callbacks);
            let responder = member.responder.clone();
            let instructions = instructions.to_string();
            join_set.spawn(async move {
                let delivery = dispatcher
                    .dispatch(&responder, &instructions, callbacks.as_ref())
                    .await;
                (responder.instance_id, delivery)
            });
        }

        let mut skipped = false;
        while !join_set.is_empty() {
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(AppError::Cancelled);
                }
                joined = join_set.join_next() => match joined {
                    Some(Ok((instance_id, Ok(delivery)))) => {
                        self.state.record_result(&instance_id, delivery.into());
                    }
                    Some(Ok((_, Err(e)))) => {
                        join_set.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => log::error!("Slave task panicked: {}", e),
                    None => break,
                },
                _ = run.skip.cancelled(), if !skipped => {
                    skipped = true;
                    log::info!("Skip requested, collecting {} unfinished slaves", join_set.len());
                    join_set.abort_all();
                }
            }
        }

        Ok(self.collect_outcomes(members, skipped, callbacks.as_ref()))
    }

    /// Slave outcomes in roster order. Slaves without a recorded result
    /// take their skipped text.
    fn collect_outcomes(
        &self,
        members: &[FlowMember],
        skipped: bool,
        callbacks: &dyn FlowCallbacks,
    ) -> Vec<SlaveOutcome> {
        members
            .iter()
            .map(|member| {
                let responder = &member.responder;
                let result = self.state.take_result(&responder.instance_id).unwrap_or_else(|| {
                    if skipped {
                        let text = self.state.skipped_text(&responder.instance_id).unwrap_or_default();
                        callbacks.on_model_complete(&responder.kind, &text, Some(&responder.instance_id));
                        CollectedResult { status: SlaveStatus::Skipped, text }
                    } else {
                        CollectedResult {
                            status: SlaveStatus::Failed,
                            text: error_text(&responder.kind, "the task ended without a result"),
                        }
                    }
                });
                SlaveOutcome {
                    instance_id: responder.instance_id.clone(),
                    kind: responder.kind.clone(),
                    alias: member.alias.clone(),
                    status: result.status,
                    text: result.text,
                }
            })
            .collect()
    }

    /// Send one message outside of any flow, with the same transports and
    /// registry as flow dispatches.
    pub async fn dispatch_single(
        &self,
        responder: &Responder,
        text: &str,
        callbacks: &dyn FlowCallbacks,
    ) -> AppResult<String> {
        let delivery = self.dispatcher.dispatch(responder, text, callbacks).await?;
        Ok(delivery.text)
    }

    /// Force-complete every pending exchange with its best text. During
    /// Executing the unfinished slaves are collected and the flow moves on.
    /// Returns how many exchanges were forced.
    pub fn skip_current_phase(&self) -> usize {
        let forced = self.registry().force_complete_all();
        let phase = self.state.phase();
        if phase == Phase::Executing {
            self.state.request_skip(&forced);
        }
        log::info!("Skip in phase {}: forced {} pending exchanges", phase, forced.len());
        forced.len()
    }

    /// Cancel the active flow and release every pending exchange without a
    /// value.
    pub fn cancel_flow(&self) {
        let had_flow = self.state.cancel();
        let released = self.registry().abandon_all();
        log::info!(
            "Cancel requested (active flow: {}), released {} pending exchanges",
            had_flow,
            released
        );
    }
}

fn dedup_slaves(slaves: Vec<Responder>) -> Vec<Responder> {
    let mut seen = HashSet::new();
    slaves
        .into_iter()
        .filter(|slave| {
            let fresh = seen.insert(slave.instance_id.clone());
            if !fresh {
                log::warn!("Dropping duplicate slave {}", slave.instance_id);
            }
            fresh
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(alias: &str, text: &str) -> SlaveOutcome {
        SlaveOutcome {
            instance_id: format!("id-{alias}"),
            kind: "gpt".into(),
            alias: alias.into(),
            status: SlaveStatus::Completed,
            text: text.into(),
        }
    }

    #[test]
    fn test_render_responses_keeps_roster_order() {
        let blocks = render_responses(&[outcome("gpt-1", "first"), outcome("gpt-2", "")]);
        assert_eq!(blocks, "[gpt-1 Response]\nfirst\n[gpt-2 Response]\n\n");
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let slaves = dedup_slaves(vec![
            Responder::new("a", "gpt"),
            Responder::new("b", "claude"),
            Responder::new("a", "gemini"),
        ]);
        let kinds: Vec<&str> = slaves.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["gpt", "claude"]);
    }

    #[test]
    fn test_unassigned_text_names_alias() {
        assert_eq!(
            unassigned_text("claude-2"),
            "[Error] No instructions were assigned to claude-2 by the planner."
        );
    }
}
