//! Transport for responders driven through an embedded automation surface.
//!
//! The surface is an externally controlled page reachable only through an
//! asynchronous message channel. Every exchange is correlated by the request
//! id of its registry entry. Text is injected and submitted as two separate
//! commands with a settling delay in between, because some pages re-render
//! their input on the first keystroke and drop an immediate submit.
//!
//! There is no timeout: long generations are legitimate, and a stalled wait
//! can always be ended with skip or cancel. Inactivity only produces
//! escalating warnings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::EngineConfig;
use crate::error::AppResult;
use crate::models::responder::Responder;
use crate::models::surface::{SurfaceCommand, SurfaceEvent};
use crate::relay::callbacks::FlowCallbacks;
use crate::relay::dispatch::{error_text, settle_interruption, Delivery};
use crate::relay::registry::ExchangeHandle;

#[async_trait]
pub trait AutomationSurface: Send + Sync {
    async fn post(&self, instance_id: &str, command: SurfaceCommand) -> AppResult<()>;

    /// Every inbound event from every surface instance.
    fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent>;

    async fn current_location(&self, instance_id: &str) -> Option<String>;
}

/// Tracks which inactivity warning is due next.
#[derive(Debug)]
pub struct InactivityWarner {
    thresholds: Vec<Duration>,
    next: usize,
}

impl InactivityWarner {
    pub fn new(thresholds: Vec<Duration>) -> Self {
        Self { thresholds, next: 0 }
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Returns the threshold just crossed, at most once per threshold
    /// between resets.
    pub fn check(&mut self, idle: Duration) -> Option<Duration> {
        let threshold = *self.thresholds.get(self.next)?;
        if idle >= threshold {
            self.next += 1;
            Some(threshold)
        } else {
            None
        }
    }
}

pub struct AutomationAdapter {
    surface: Arc<dyn AutomationSurface>,
    settle: Duration,
    thresholds: Vec<Duration>,
    check_interval: Duration,
    link_attempts: u32,
    link_backoff: Duration,
}

impl AutomationAdapter {
    pub fn new(surface: Arc<dyn AutomationSurface>, config: &EngineConfig) -> Self {
        Self {
            surface,
            settle: config.inject_settle(),
            thresholds: config.inactivity_thresholds(),
            check_interval: config.activity_check_interval(),
            link_attempts: config.link_retry_attempts,
            link_backoff: config.link_retry_backoff(),
        }
    }

    pub async fn exchange(
        &self,
        responder: &Responder,
        text: &str,
        exchange: &mut ExchangeHandle,
        callbacks: &dyn FlowCallbacks,
    ) -> AppResult<Delivery> {
        let kind = responder.kind.as_str();
        let instance_id = responder.instance_id.as_str();
        let request_id = exchange.request_id().to_string();
        let hints = responder.target.clone().unwrap_or_default();

        let mut events = self.surface.subscribe();
        let origin = self.surface.current_location(instance_id).await;

        let inject = SurfaceCommand::InjectText {
            request_id: request_id.clone(),
            text: text.to_string(),
            target_hints: hints.clone(),
            submit: false,
            skip_inject: false,
        };
        let submit = SurfaceCommand::InjectText {
            request_id: request_id.clone(),
            text: text.to_string(),
            target_hints: hints,
            submit: true,
            skip_inject: true,
        };

        let started = async {
            self.surface
                .post(instance_id, SurfaceCommand::StartMonitoring { request_id: request_id.clone() })
                .await?;
            self.surface.post(instance_id, inject).await
        };
        let started = tokio::select! {
            biased;
            interruption = exchange.interrupted() => return settle_interruption(interruption),
            started = started => started,
        };
        if let Err(e) = started {
            log::warn!("[Relay:{}] Failed to inject text: {}", instance_id, e);
            return Ok(Delivery::failed(error_text(
                kind,
                &format!("could not reach the automation surface: {e}"),
            )));
        }

        tokio::select! {
            biased;
            interruption = exchange.interrupted() => return settle_interruption(interruption),
            _ = tokio::time::sleep(self.settle) => {}
        }

        let submitted = tokio::select! {
            biased;
            interruption = exchange.interrupted() => return settle_interruption(interruption),
            submitted = self.surface.post(instance_id, submit) => submitted,
        };
        if let Err(e) = submitted {
            log::warn!("[Relay:{}] Failed to submit: {}", instance_id, e);
            return Ok(Delivery::failed(error_text(
                kind,
                &format!("could not submit on the automation surface: {e}"),
            )));
        }
        log::info!("[Relay:{}] Submitted request {} ({} chars)", instance_id, request_id, text.len());

        let mut warner = InactivityWarner::new(self.thresholds.clone());
        let mut ticker = tokio::time::interval(self.check_interval);
        // Consume the first immediate tick
        ticker.tick().await;

        let final_text = loop {
            tokio::select! {
                biased;
                interruption = exchange.interrupted() => return settle_interruption(interruption),
                received = events.recv() => match received {
                    Ok(event) => {
                        if event.request_id() != Some(request_id.as_str()) {
                            continue;
                        }
                        match event {
                            SurfaceEvent::Heartbeat { status, .. } => {
                                exchange.touch();
                                warner.reset();
                                log::trace!("[Relay:{}] Heartbeat: {}", instance_id, status);
                            }
                            SurfaceEvent::ResponseChunk { text, .. } => {
                                exchange.update_text(&text);
                                warner.reset();
                                callbacks.on_model_update(kind, &text, Some(instance_id));
                            }
                            SurfaceEvent::ResponseComplete { text, .. } => {
                                break if text.trim().is_empty() { exchange.best_text() } else { text };
                            }
                            SurfaceEvent::LocationChanged { .. } => {}
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("[Relay:{}] Event channel lagged, {} messages dropped", instance_id, missed);
                    }
                    Err(RecvError::Closed) => {
                        log::error!("[Relay:{}] Automation event channel closed", instance_id);
                        return Ok(Delivery::failed(error_text(kind, "automation channel closed")));
                    }
                },
                _ = ticker.tick() => {
                    let idle = exchange.last_activity().elapsed();
                    if let Some(threshold) = warner.check(idle) {
                        log::warn!(
                            "[Relay:{}] No activity on request {} for {}s (still waiting)",
                            instance_id,
                            request_id,
                            threshold.as_secs(),
                        );
                    }
                }
            }
        };

        exchange.update_text(&final_text);
        log::info!("[Relay:{}] Request {} complete ({} chars)", instance_id, request_id, final_text.len());

        if let Some(location) = self.recover_location(instance_id, origin.as_deref()).await {
            callbacks.on_conversation_link(instance_id, &location, Some(kind));
        }

        Ok(Delivery::completed(final_text))
    }

    /// Wait for the surface to navigate away from `origin` (its persisted
    /// conversation address), falling back to whatever is current.
    async fn recover_location(&self, instance_id: &str, origin: Option<&str>) -> Option<String> {
        let mut delay = self.link_backoff;
        for attempt in 1..=self.link_attempts {
            let current = self.surface.current_location(instance_id).await;
            if current.is_some() && current.as_deref() != origin {
                return current;
            }
            log::debug!(
                "[Relay:{}] Conversation link not ready (attempt {}/{}), retrying in {:?}",
                instance_id,
                attempt,
                self.link_attempts,
                delay,
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        self.surface.current_location(instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warner_escalates_once_per_threshold() {
        let mut warner = InactivityWarner::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(120),
        ]);
        assert_eq!(warner.check(Duration::from_secs(5)), None);
        assert_eq!(warner.check(Duration::from_secs(11)), Some(Duration::from_secs(10)));
        assert_eq!(warner.check(Duration::from_secs(12)), None);
        assert_eq!(warner.check(Duration::from_secs(31)), Some(Duration::from_secs(30)));
        assert_eq!(warner.check(Duration::from_secs(500)), Some(Duration::from_secs(120)));
        assert_eq!(warner.check(Duration::from_secs(900)), None);

        warner.reset();
        assert_eq!(warner.check(Duration::from_secs(10)), Some(Duration::from_secs(10)));
    }
}
