//! Tracks in-flight exchanges so they can be force-completed (skip) or
//! released without a value (cancel).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ExchangeProgress {
    best_text: String,
    last_activity: Instant,
}

type SharedProgress = Arc<Mutex<ExchangeProgress>>;

fn lock_progress(progress: &SharedProgress) -> MutexGuard<'_, ExchangeProgress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingExchange {
    instance_id: String,
    kind: String,
    completer: oneshot::Sender<String>,
    release: CancellationToken,
    progress: SharedProgress,
}

/// An exchange that was force-completed by a skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedExchange {
    pub request_id: String,
    pub instance_id: String,
    pub kind: String,
    pub text: String,
}

/// Why an exchange stopped waiting before its transport settled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// Skipped: complete with the delivered text.
    Forced(String),
    /// Cancelled: stop listening and deliver nothing.
    Released,
}

#[derive(Clone, Default)]
pub struct PendingRegistry {
    entries: Arc<Mutex<HashMap<String, PendingExchange>>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingExchange>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new exchange under a fresh request id. The entry lives
    /// until the returned handle is dropped or the exchange is forced/released.
    pub fn register(&self, instance_id: &str, kind: &str) -> ExchangeHandle {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (completer, forced_rx) = oneshot::channel();
        let release = CancellationToken::new();
        let progress = Arc::new(Mutex::new(ExchangeProgress {
            best_text: String::new(),
            last_activity: Instant::now(),
        }));

        self.entries().insert(
            request_id.clone(),
            PendingExchange {
                instance_id: instance_id.to_string(),
                kind: kind.to_string(),
                completer,
                release: release.clone(),
                progress: Arc::clone(&progress),
            },
        );
        log::debug!("[Registry] Registered exchange {} for {}", request_id, instance_id);

        ExchangeHandle {
            request_id,
            progress,
            forced_rx,
            release,
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries().contains_key(request_id)
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn best_text(&self, request_id: &str) -> Option<String> {
        self.entries()
            .get(request_id)
            .map(|entry| lock_progress(&entry.progress).best_text.clone())
    }

    pub fn last_activity(&self, request_id: &str) -> Option<Instant> {
        self.entries()
            .get(request_id)
            .map(|entry| lock_progress(&entry.progress).last_activity)
    }

    /// Complete every pending exchange with its best text so far and
    /// release it.
    pub fn force_complete_all(&self) -> Vec<ForcedExchange> {
        let drained: Vec<(String, PendingExchange)> = self.entries().drain().collect();
        let mut forced = Vec::with_capacity(drained.len());
        for (request_id, entry) in drained {
            let text = lock_progress(&entry.progress).best_text.clone();
            if entry.completer.send(text.clone()).is_err() {
                log::debug!("[Registry] Exchange {} settled before it could be forced", request_id);
            }
            forced.push(ForcedExchange {
                request_id,
                instance_id: entry.instance_id,
                kind: entry.kind,
                text,
            });
        }
        forced
    }

    /// Release every pending exchange without delivering a value.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<PendingExchange> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.release.cancel();
        }
        drained.len()
    }

    fn remove(&self, request_id: &str) {
        if self.entries().remove(request_id).is_some() {
            log::debug!("[Registry] Exchange {} settled", request_id);
        }
    }
}

/// The transport-side view of one registered exchange.
pub struct ExchangeHandle {
    request_id: String,
    progress: SharedProgress,
    forced_rx: oneshot::Receiver<String>,
    release: CancellationToken,
    registry: PendingRegistry,
}

impl ExchangeHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Note liveness without changing the best text.
    pub fn touch(&self) {
        lock_progress(&self.progress).last_activity = Instant::now();
    }

    pub fn update_text(&self, text: &str) {
        let mut progress = lock_progress(&self.progress);
        progress.best_text = text.to_string();
        progress.last_activity = Instant::now();
    }

    pub fn best_text(&self) -> String {
        lock_progress(&self.progress).best_text.clone()
    }

    pub fn last_activity(&self) -> Instant {
        lock_progress(&self.progress).last_activity
    }

    /// Resolves once the exchange is skipped or cancelled. Must not be
    /// awaited again after it resolved.
    pub async fn interrupted(&mut self) -> Interruption {
        tokio::select! {
            biased;
            _ = self.release.cancelled() => Interruption::Released,
            forced = &mut self.forced_rx => match forced {
                Ok(text) => Interruption::Forced(text),
                Err(_) => Interruption::Released,
            },
        }
    }
}

impl Drop for ExchangeHandle {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_deregisters() {
        let registry = PendingRegistry::new();
        let handle = registry.register("slot-1", "gpt");
        let id = handle.request_id().to_string();
        assert!(registry.contains(&id));

        drop(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let registry = PendingRegistry::new();
        let a = registry.register("slot-1", "gpt");
        let b = registry.register("slot-1", "gpt");
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_force_complete_delivers_best_text() {
        let registry = PendingRegistry::new();
        let mut handle = registry.register("slot-1", "gpt");
        handle.update_text("partial");
        assert_eq!(registry.best_text(handle.request_id()).as_deref(), Some("partial"));

        let forced = registry.force_complete_all();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].text, "partial");
        assert_eq!(forced[0].instance_id, "slot-1");
        assert!(registry.is_empty());

        assert_eq!(handle.interrupted().await, Interruption::Forced("partial".into()));
    }

    #[tokio::test]
    async fn test_abandon_releases_without_value() {
        let registry = PendingRegistry::new();
        let mut first = registry.register("slot-1", "gpt");
        let mut second = registry.register("slot-2", "claude");
        second.update_text("ignored");

        assert_eq!(registry.abandon_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(first.interrupted().await, Interruption::Released);
        assert_eq!(second.interrupted().await, Interruption::Released);
    }

    #[test]
    fn test_force_with_nothing_pending_is_noop() {
        let registry = PendingRegistry::new();
        assert!(registry.force_complete_all().is_empty());
        assert_eq!(registry.abandon_all(), 0);
    }

    #[tokio::test]
    async fn test_touch_advances_last_activity() {
        let registry = PendingRegistry::new();
        let handle = registry.register("slot-1", "gpt");
        let before = registry.last_activity(handle.request_id()).expect("registered");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        handle.touch();
        let after = registry.last_activity(handle.request_id()).expect("registered");
        assert!(after > before);
        assert_eq!(handle.best_text(), "");
    }
}
