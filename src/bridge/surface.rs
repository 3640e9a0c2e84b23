//! `AutomationSurface` backed by one bridge process per responder instance.
//!
//! Each bridge reads NDJSON commands on stdin and writes NDJSON events on
//! stdout. Events from every bridge fan into one broadcast channel; the
//! automation adapter filters them by request id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::bridge::manager::{self, BridgeProcess};
use crate::error::{AppError, AppResult};
use crate::models::surface::{SurfaceCommand, SurfaceEvent};
use crate::relay::automation::AutomationSurface;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type LocationMap = Arc<Mutex<HashMap<String, String>>>;

fn lock_locations(locations: &LocationMap) -> MutexGuard<'_, HashMap<String, String>> {
    locations.lock().unwrap_or_else(PoisonError::into_inner)
}

struct AttachedBridge {
    process: BridgeProcess,
    reader_cancel: CancellationToken,
}

pub struct BridgeSurface {
    /// Configured bridge script; `None` searches the default locations.
    bridge_script: Option<PathBuf>,
    bridges: Arc<AsyncMutex<HashMap<String, AttachedBridge>>>,
    locations: LocationMap,
    events: broadcast::Sender<SurfaceEvent>,
    shutdown: CancellationToken,
}

impl Default for BridgeSurface {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BridgeSurface {
    pub fn new(bridge_script: Option<PathBuf>) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            bridge_script,
            bridges: Arc::new(AsyncMutex::new(HashMap::new())),
            locations: Arc::new(Mutex::new(HashMap::new())),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a bridge for `instance_id` and begin reading its events.
    pub async fn attach(&self, instance_id: &str, config_json: &str) -> AppResult<()> {
        if self.bridges.lock().await.contains_key(instance_id) {
            return Err(already_attached(instance_id));
        }

        // Spawning waits out the startup grace period; the map stays unlocked meanwhile
        let script = manager::get_bridge_path(self.bridge_script.as_deref())?;
        let (mut process, stdout) = manager::spawn_bridge(instance_id, &script, config_json).await?;

        let mut bridges = self.bridges.lock().await;
        if bridges.contains_key(instance_id) {
            drop(bridges);
            log::warn!("[Bridge:{}] Attached concurrently, stopping the duplicate", instance_id);
            manager::stop_bridge_process(&mut process).await?;
            return Err(already_attached(instance_id));
        }

        let reader_cancel = self.shutdown.child_token();
        tokio::spawn(run_event_reader(
            instance_id.to_string(),
            BufReader::new(stdout),
            self.events.clone(),
            Arc::clone(&self.locations),
            reader_cancel.clone(),
        ));

        bridges.insert(instance_id.to_string(), AttachedBridge { process, reader_cancel });
        Ok(())
    }

    /// Stop the bridge for `instance_id`.
    pub async fn detach(&self, instance_id: &str) -> AppResult<()> {
        let attached = self.bridges.lock().await.remove(instance_id);
        let Some(mut attached) = attached else {
            return Err(AppError::NotFound(format!("No bridge attached for {instance_id}")));
        };
        attached.reader_cancel.cancel();
        lock_locations(&self.locations).remove(instance_id);
        manager::stop_bridge_process(&mut attached.process).await
    }

    pub async fn is_alive(&self, instance_id: &str) -> bool {
        match self.bridges.lock().await.get_mut(instance_id) {
            Some(attached) => manager::check_process_alive(&mut attached.process),
            None => false,
        }
    }

    /// Stop every bridge.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(String, AttachedBridge)> = self.bridges.lock().await.drain().collect();
        for (instance_id, mut attached) in drained {
            if let Err(e) = manager::stop_bridge_process(&mut attached.process).await {
                log::warn!("[Bridge:{}] Failed to stop during shutdown: {}", instance_id, e);
            }
        }
        lock_locations(&self.locations).clear();
    }
}

#[async_trait]
impl AutomationSurface for BridgeSurface {
    async fn post(&self, instance_id: &str, command: SurfaceCommand) -> AppResult<()> {
        // Only this bridge's stdin is held while writing
        let stdin = {
            let bridges = self.bridges.lock().await;
            let attached = bridges
                .get(instance_id)
                .ok_or_else(|| AppError::NotFound(format!("No bridge attached for {instance_id}")))?;
            Arc::clone(&attached.process.stdin)
        };
        let mut stdin = stdin.lock().await;
        manager::write_command(&mut *stdin, &command).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }

    async fn current_location(&self, instance_id: &str) -> Option<String> {
        lock_locations(&self.locations).get(instance_id).cloned()
    }
}

fn already_attached(instance_id: &str) -> AppError {
    AppError::InvalidRequest(format!("A bridge is already attached for {instance_id}"))
}

/// Parse one stdout line. Blank and unrecognized lines yield `None`.
pub fn decode_bridge_line(line: &str) -> Option<SurfaceEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => SurfaceEvent::decode(value),
        Err(e) => {
            log::warn!("Failed to parse NDJSON: '{}', error: {}", trimmed, e);
            None
        }
    }
}

/// Forward events from one bridge's stdout until it closes or `cancel` fires.
pub async fn run_event_reader<R>(
    instance_id: String,
    reader: R,
    events: broadcast::Sender<SurfaceEvent>,
    locations: LocationMap,
    cancel: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    log::info!("[Bridge:{}] Event reader started", instance_id);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[Bridge:{}] Event reader cancelled", instance_id);
                break;
            }
            line_result = lines.next_line() => match line_result {
                Ok(Some(line)) => {
                    let Some(event) = decode_bridge_line(&line) else {
                        continue;
                    };
                    if let SurfaceEvent::LocationChanged { url } = &event {
                        log::debug!("[Bridge:{}] Location changed: {}", instance_id, url);
                        lock_locations(&locations).insert(instance_id.clone(), url.clone());
                    }
                    // No subscribers just means nobody is waiting on this bridge
                    let _ = events.send(event);
                }
                Ok(None) => {
                    log::info!("[Bridge:{}] stdout closed, ending event reader", instance_id);
                    break;
                }
                Err(e) => {
                    log::error!("[Bridge:{}] Error reading stdout: {}", instance_id, e);
                    break;
                }
            }
        }
    }
}
