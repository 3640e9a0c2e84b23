//! Single-responder send: transport selection, exchange registration and
//! model start/complete notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use crate::models::responder::Responder;
use crate::relay::api::{ApiCredential, ChatApi, CredentialStore};
use crate::relay::automation::{AutomationAdapter, AutomationSurface};
use crate::relay::callbacks::FlowCallbacks;
use crate::relay::registry::{ExchangeHandle, Interruption, PendingRegistry};
use crate::relay::streaming::{StreamingAdapter, StreamingService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    /// The responder failed; the text describes the failure.
    Failed,
    /// Skipped; the text is the best partial seen.
    Forced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub text: String,
    pub settlement: Settlement,
}

impl Delivery {
    pub fn completed(text: impl Into<String>) -> Self {
        Self { text: text.into(), settlement: Settlement::Completed }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self { text: text.into(), settlement: Settlement::Failed }
    }

    pub fn forced(text: impl Into<String>) -> Self {
        Self { text: text.into(), settlement: Settlement::Forced }
    }
}

/// Error-shaped result text for a responder that failed to answer.
pub fn error_text(kind: &str, detail: &str) -> String {
    format!("[Error] {kind} failed to respond: {detail}")
}

pub(crate) fn settle_interruption(interruption: Interruption) -> AppResult<Delivery> {
    match interruption {
        Interruption::Forced(text) => Ok(Delivery::forced(text)),
        Interruption::Released => Err(AppError::Cancelled),
    }
}

/// One step of the transport plan, tried in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Api(ApiCredential),
    Streaming,
    Automation,
}

impl Transport {
    fn name(&self) -> &'static str {
        match self {
            Transport::Api(_) => "api",
            Transport::Streaming => "streaming",
            Transport::Automation => "automation",
        }
    }
}

type InstanceLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// A claim on one instance's lock. The map entry is removed when the last
/// claim is dropped.
struct InstanceLease<'a> {
    locks: &'a InstanceLocks,
    instance_id: &'a str,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for InstanceLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let unclaimed = locks
            .get(self.instance_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        if unclaimed {
            locks.remove(self.instance_id);
        }
    }
}

pub struct Dispatcher {
    config: EngineConfig,
    registry: PendingRegistry,
    credentials: Option<Arc<dyn CredentialStore>>,
    api: Option<Arc<dyn ChatApi>>,
    streaming: Option<StreamingAdapter>,
    automation: AutomationAdapter,
    /// One lock per responder instance: at most one request in flight each.
    instance_locks: InstanceLocks,
}

impl Dispatcher {
    pub fn new(config: EngineConfig, surface: Arc<dyn AutomationSurface>) -> Self {
        let automation = AutomationAdapter::new(surface, &config);
        Self {
            config,
            registry: PendingRegistry::new(),
            credentials: None,
            api: None,
            streaming: None,
            automation,
            instance_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_api(mut self, credentials: Arc<dyn CredentialStore>, api: Arc<dyn ChatApi>) -> Self {
        self.credentials = Some(credentials);
        self.api = Some(api);
        self
    }

    pub fn with_streaming(mut self, service: Arc<dyn StreamingService>) -> Self {
        self.streaming = Some(StreamingAdapter::new(service));
        self
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transports to try for a responder, in order. A failed API call falls
    /// through to the next entry.
    pub fn transport_plan(&self, responder: &Responder) -> Vec<Transport> {
        let mut plan = Vec::with_capacity(2);
        if self.api.is_some() {
            if let Some(credential) = self.credentials.as_ref().and_then(|c| c.credential_for(responder)) {
                plan.push(Transport::Api(credential));
            }
        }
        match &self.streaming {
            Some(adapter) if adapter.handles(responder) => plan.push(Transport::Streaming),
            _ => plan.push(Transport::Automation),
        }
        plan
    }

    fn instance_lock<'a>(&'a self, instance_id: &'a str) -> InstanceLease<'a> {
        let mut locks = self.instance_locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(instance_id.to_string()).or_default());
        InstanceLease { locks: &self.instance_locks, instance_id, lock }
    }

    /// Instances with a dispatch in flight or waiting.
    pub fn busy_instances(&self) -> usize {
        self.instance_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Send `text` to one responder and wait for its final answer.
    ///
    /// Responder-side failures resolve with error text; the only error is
    /// `AppError::Cancelled`, when the exchange was released by a cancel.
    pub async fn dispatch(
        &self,
        responder: &Responder,
        text: &str,
        callbacks: &dyn FlowCallbacks,
    ) -> AppResult<Delivery> {
        let kind = responder.kind.as_str();
        let instance_id = responder.instance_id.as_str();

        let lease = self.instance_lock(instance_id);
        let _in_flight = lease.lock.lock().await;

        callbacks.on_model_start(kind, Some(instance_id));
        let mut exchange = self.registry.register(instance_id, kind);

        let mut delivery = None;
        let mut last_error = None;
        for transport in self.transport_plan(responder) {
            let attempt = match &transport {
                Transport::Api(credential) => {
                    self.api_exchange(responder, text, credential, &mut exchange).await
                }
                Transport::Streaming => {
                    let Some(adapter) = self.streaming.as_ref() else {
                        continue;
                    };
                    adapter.exchange(responder, text, &mut exchange, callbacks).await
                }
                Transport::Automation => {
                    self.automation.exchange(responder, text, &mut exchange, callbacks).await
                }
            };

            match attempt {
                Ok(settled) => {
                    delivery = Some(settled);
                    break;
                }
                Err(AppError::Cancelled) => {
                    log::info!("[Relay:{}] Exchange released by cancellation", instance_id);
                    return Err(AppError::Cancelled);
                }
                Err(e) => {
                    log::warn!(
                        "[Relay:{}] {} transport failed, trying next transport: {}",
                        instance_id,
                        transport.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        drop(exchange);

        let delivery = delivery.unwrap_or_else(|| {
            let detail = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no transport available".into());
            Delivery::failed(error_text(kind, &detail))
        });
        callbacks.on_model_complete(kind, &delivery.text, Some(instance_id));
        Ok(delivery)
    }

    async fn api_exchange(
        &self,
        responder: &Responder,
        text: &str,
        credential: &ApiCredential,
        exchange: &mut ExchangeHandle,
    ) -> AppResult<Delivery> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| AppError::Internal("No API client configured".into()))?;
        let history = responder.history.recent(self.config.history_limit);

        tokio::select! {
            biased;
            interruption = exchange.interrupted() => settle_interruption(interruption),
            reply = api.complete(credential, &history, text) => {
                let text = reply?.into_text();
                exchange.update_text(&text);
                Ok(Delivery::completed(text))
            }
        }
    }
}
