//! Watch lifecycle management inside the daemon.
//!
//! Watch mode runs in a dedicated background thread so RPC calls return
//! immediately and queries stay responsive. A `Starting` sentinel is
//! installed under the manager lock before the thread spawns, closing the
//! race where two starts slip in before the real handler exists; failures
//! replace the sentinel with an `Error` carrying the message.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::embed::EmbeddingProvider;
use crate::git::GitTopologyService;
use crate::indexer::SmartIndexer;
use crate::storage::VectorBackend;
use crate::watch::GitAwareWatchHandler;

/// Time allowed for the watch thread to wind down on stop
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of the keep-alive loop inside the watch thread
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What currently occupies the handler slot.
enum HandlerSlot {
    Starting,
    Error(String),
    Ready(Arc<GitAwareWatchHandler>),
}

#[derive(Default)]
struct WatchState {
    thread: Option<std::thread::JoinHandle<()>>,
    handler: Option<HandlerSlot>,
    project_path: Option<PathBuf>,
    started_at: Option<Instant>,
}

/// Settable stop event with a timed wait.
struct StopEvent {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl StopEvent {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.flag.lock().expect("stop event poisoned") = true;
        self.condvar.notify_all();
    }

    fn clear(&self) {
        *self.flag.lock().expect("stop event poisoned") = false;
    }

    /// Wait up to `timeout`; returns true when the event was set.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().expect("stop event poisoned");
        if *guard {
            return true;
        }
        let (guard, _) = self
            .condvar
            .wait_timeout(guard, timeout)
            .expect("stop event poisoned");
        *guard
    }
}

/// Everything the watch thread needs to construct its handler.
pub struct WatchDeps {
    pub config: DaemonConfig,
    pub config_dir: PathBuf,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub store: Arc<dyn VectorBackend>,
}

pub struct WatchManager {
    state: Arc<Mutex<WatchState>>,
    stop_event: Arc<StopEvent>,
}

impl Default for WatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WatchState::default())),
            stop_event: Arc::new(StopEvent::new()),
        }
    }

    fn is_running_locked(state: &WatchState) -> bool {
        state
            .thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
            && state.handler.is_some()
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock().expect("watch state poisoned");
        Self::is_running_locked(&state)
    }

    /// Start watch mode in a background thread (non-blocking). Only one
    /// watch per daemon: starting while one runs is an error that leaves
    /// the running watch untouched.
    pub fn start_watch(&self, project_path: &Path, deps: WatchDeps) -> serde_json::Value {
        let mut state = self.state.lock().expect("watch state poisoned");

        if Self::is_running_locked(&state) {
            let running = state
                .project_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            warn!("watch already running for {running}");
            return json!({
                "status": "error",
                "message": format!("watch already running for {running}"),
            });
        }

        self.stop_event.clear();
        state.project_path = Some(project_path.to_path_buf());
        state.started_at = Some(Instant::now());
        // Sentinel blocks concurrent starts until the thread installs the
        // real handler
        state.handler = Some(HandlerSlot::Starting);

        let project = project_path.to_path_buf();
        let stop_event = Arc::clone(&self.stop_event);
        let shared_state = Arc::clone(&self.state);

        let thread = std::thread::Builder::new()
            .name("daemon-watch".to_string())
            .spawn(move || watch_thread_worker(shared_state, &project, deps, stop_event));

        match thread {
            Ok(handle) => {
                state.thread = Some(handle);
                info!("watch started in background for {}", project_path.display());
                json!({"status": "success", "message": "watch started in background"})
            }
            Err(e) => {
                state.handler = Some(HandlerSlot::Error(e.to_string()));
                json!({"status": "error", "message": format!("failed to start watch thread: {e}")})
            }
        }
    }

    /// Stop watch mode gracefully, returning final statistics. Joins the
    /// thread for up to five seconds; past that the thread is abandoned
    /// but manager state is cleared.
    pub fn stop_watch(&self) -> serde_json::Value {
        let (handler, thread, project) = {
            let mut state = self.state.lock().expect("watch state poisoned");
            if state.handler.is_none() && state.thread.is_none() {
                warn!("no watch running to stop");
                return json!({"status": "error", "message": "watch not running"});
            }

            let handler = match state.handler.take() {
                Some(HandlerSlot::Ready(handler)) => Some(handler),
                _ => None,
            };
            (handler, state.thread.take(), state.project_path.take())
        };

        let stats = handler
            .as_ref()
            .map(|h| serde_json::to_value(h.get_stats()).unwrap_or_default())
            .unwrap_or_else(|| json!({}));

        self.stop_event.set();
        if let Some(handler) = &handler {
            handler.stop_watching();
        }

        if let Some(thread) = thread {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                warn!("watch thread did not stop within 5 seconds, abandoning");
            }
        }

        {
            let mut state = self.state.lock().expect("watch state poisoned");
            state.thread = None;
            state.handler = None;
            state.project_path = None;
            state.started_at = None;
        }

        info!(
            "watch stopped for {}",
            project.map(|p| p.display().to_string()).unwrap_or_default()
        );
        json!({"status": "success", "message": "watch stopped", "stats": stats})
    }

    /// Current watch status and statistics.
    pub fn get_stats(&self) -> serde_json::Value {
        let state = self.state.lock().expect("watch state poisoned");

        match state.handler.as_ref() {
            Some(HandlerSlot::Starting) => json!({"status": "starting"}),
            Some(HandlerSlot::Error(message)) => {
                json!({"status": "error", "error": message})
            }
            Some(HandlerSlot::Ready(handler)) if Self::is_running_locked(&state) => {
                let uptime = state
                    .started_at
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                let stats = handler.get_stats();
                json!({
                    "status": "running",
                    "project_path": state
                        .project_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    "uptime_seconds": uptime,
                    "files_processed": stats.files_processed,
                    "indexing_cycles": stats.indexing_cycles,
                    "branch_switches": stats.branch_switches,
                    "last_error": stats.last_error,
                })
            }
            _ => json!({
                "status": "idle",
                "project_path": null,
                "uptime_seconds": 0,
                "files_processed": 0,
            }),
        }
    }
}

/// Body of the background watch thread: construct the real handler,
/// install it, keep alive until stopped, tear down state on exit.
fn watch_thread_worker(
    state: Arc<Mutex<WatchState>>,
    project_path: &Path,
    deps: WatchDeps,
    stop_event: Arc<StopEvent>,
) {
    info!("watch thread starting for {}", project_path.display());

    let indexer = SmartIndexer::new(
        &deps.config,
        &deps.config_dir,
        Arc::clone(&deps.provider),
        Arc::clone(&deps.store),
    );
    let topology = GitTopologyService::new(deps.config.resolve_codebase_dir(&deps.config_dir));
    let handler = Arc::new(GitAwareWatchHandler::new(
        project_path.to_path_buf(),
        Duration::from_millis(deps.config.daemon.watch_debounce_ms),
        indexer,
        topology,
    ));

    if let Err(e) = handler.start_watching() {
        error!("watch handler failed to start: {e}");
        let mut guard = state.lock().expect("watch state poisoned");
        guard.handler = Some(HandlerSlot::Error(e.to_string()));
        return;
    }

    {
        let mut guard = state.lock().expect("watch state poisoned");
        guard.handler = Some(HandlerSlot::Ready(Arc::clone(&handler)));
    }

    // Keep-alive loop: a settable stop event with a one-second wait, plus
    // the handler's own liveness flag
    loop {
        if stop_event.wait(STOP_POLL_INTERVAL) {
            info!("stop event received, exiting watch thread");
            break;
        }
        if !handler.is_watching() {
            info!("watch handler stopped internally");
            break;
        }
    }

    handler.stop_watching();

    info!("watch thread exiting for {}", project_path.display());
    let mut guard = state.lock().expect("watch state poisoned");
    guard.thread = None;
    guard.handler = None;
    guard.project_path = None;
    guard.started_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_without_start_errors() {
        let manager = WatchManager::new();
        let result = manager.stop_watch();
        assert_eq!(result["status"], "error");
        assert!(!manager.is_running());
    }

    #[test]
    fn test_idle_stats() {
        let manager = WatchManager::new();
        let stats = manager.get_stats();
        assert_eq!(stats["status"], "idle");
        assert_eq!(stats["files_processed"], 0);
    }

    #[test]
    fn test_stop_event_wait() {
        let event = StopEvent::new();
        assert!(!event.wait(Duration::from_millis(20)));
        event.set();
        assert!(event.wait(Duration::from_millis(20)));
        event.clear();
        assert!(!event.wait(Duration::from_millis(20)));
    }
}
