//! Transport for the responder backed by a shared streaming conversation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::AppResult;
use crate::models::responder::Responder;
use crate::relay::callbacks::FlowCallbacks;
use crate::relay::dispatch::{error_text, settle_interruption, Delivery};
use crate::relay::registry::ExchangeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAuthor {
    User,
    Responder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub author: StreamAuthor,
    pub text: String,
}

/// One published state of the external streaming conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub is_streaming: bool,
    pub entries: Vec<StreamEntry>,
    pub error: Option<String>,
}

impl StreamSnapshot {
    /// Text of the latest entry, if the responder wrote it.
    pub fn latest_responder_text(&self) -> Option<&str> {
        self.entries
            .last()
            .filter(|e| e.author == StreamAuthor::Responder)
            .map(|e| e.text.as_str())
    }
}

/// Process-wide publisher for one streaming conversation.
pub struct StreamHub {
    tx: watch::Sender<StreamSnapshot>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StreamSnapshot::default());
        Self { tx }
    }

    pub fn publish(&self, snapshot: StreamSnapshot) {
        // send_replace stores the value even when nobody is subscribed
        self.tx.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StreamSnapshot {
        self.tx.borrow().clone()
    }
}

#[async_trait]
pub trait StreamingService: Send + Sync {
    /// The responder kind this service answers for.
    fn kind(&self) -> &str;

    fn subscribe(&self) -> watch::Receiver<StreamSnapshot>;

    async fn submit(&self, text: &str) -> AppResult<()>;
}

pub struct StreamingAdapter {
    service: Arc<dyn StreamingService>,
}

impl StreamingAdapter {
    pub fn new(service: Arc<dyn StreamingService>) -> Self {
        Self { service }
    }

    pub fn handles(&self, responder: &Responder) -> bool {
        responder.kind == self.service.kind()
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

        // Subscribe before submitting so no published state is missed. The
        // watch channel keeps only the latest value, so intermediate states
        // may never be observed; the baseline tells a finished answer apart
        // from the conversation as it stood before this prompt.
        let mut rx = self.service.subscribe();
        let baseline = rx.borrow_and_update().clone();

        if let Err(e) = self.service.submit(text).await {
            log::warn!("[Relay:{}] Streaming submit failed: {}", instance_id, e);
            return Ok(Delivery::failed(error_text(kind, &e.to_string())));
        }

        let mut seen_streaming = false;
        let mut last_text = String::new();

        loop {
            tokio::select! {
                biased;
                interruption = exchange.interrupted() => return settle_interruption(interruption),
                changed = rx.changed() => {
                    if changed.is_err() {
                        log::warn!("[Relay:{}] Stream publisher closed mid-response", instance_id);
                        return Ok(Delivery::failed(error_text(kind, "stream closed before the response finished")));
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    if snapshot == baseline {
                        continue;
                    }

                    if let Some(err) = snapshot.error.as_deref() {
                        log::warn!("[Relay:{}] Stream reported error: {}", instance_id, err);
                        return Ok(Delivery::failed(error_text(kind, err)));
                    }

                    if snapshot.is_streaming {
                        seen_streaming = true;
                        if let Some(partial) = snapshot.latest_responder_text() {
                            if partial != last_text {
                                last_text = partial.to_string();
                                exchange.update_text(&last_text);
                                callbacks.on_model_update(kind, &last_text, Some(instance_id));
                            }
                        }
                        continue;
                    }

                    // Without a streaming state, only a new responder entry
                    // counts as the answer to this prompt.
                    let grew = snapshot.entries.len() > baseline.entries.len();
                    match snapshot.latest_responder_text() {
                        Some(final_text) if seen_streaming || grew => last_text = final_text.to_string(),
                        _ if !seen_streaming => continue,
                        _ => {}
                    }
                    log::debug!("[Relay:{}] Stream ended ({} chars)", instance_id, last_text.len());
                    return Ok(Delivery::completed(last_text));
                }
            }
        }
    }
}
