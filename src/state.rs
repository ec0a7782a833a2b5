//! Process-wide State owner (§3 State / §5 "mutated only through `update()`").
//!
//! A single `Arc<State>` is shared across every accepted connection; readers
//! take a snapshot (clone of `Configuration`, clone of the compiled route
//! list) at the start of each request so that, per §5's ordering guarantee,
//! in-flight requests finish under the config snapshot that was current when
//! they were accepted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::config::Configuration;
use crate::mapping::{self, Route};
use crate::recorder::{Mode, MockStore};

#[derive(Clone, Debug)]
pub struct LogEvent {
    pub sequence: u64,
    pub line: String,
}

/// How many past log lines `replay_since` can recover for a reconnecting
/// `logs://` subscriber (§3 Recorder Buffer, §4.9 "resumes missed records
/// via a monotonic sequence number sent on reconnect"). Older entries are
/// simply unrecoverable, matching the broadcast channel's own bounded
/// backlog for live subscribers.
const LOG_REPLAY_CAPACITY: usize = 1024;

/// A config-mutation request, as POSTed to `config://` (§4.9). Only the
/// fields present in the JSON body are applied; absent fields leave the
/// current configuration untouched, mirroring `serde_json`'s merge-by-
/// presence behavior used throughout C1.
pub struct ConfigPatch {
    pub new_config: Configuration,
}

pub struct State {
    config: RwLock<Configuration>,
    routes: RwLock<Arc<Vec<Route>>>,
    pub mock_store: tokio::sync::Mutex<MockStore>,
    mode: RwLock<Mode>,
    logs_tx: broadcast::Sender<LogEvent>,
    log_buffer: std::sync::Mutex<VecDeque<LogEvent>>,
    sequence: AtomicU64,
    restart_notify: tokio::sync::Notify,
}

impl State {
    pub fn new(config: Configuration) -> anyhow::Result<Arc<State>> {
        let routes = mapping::compile(&config)?;
        let (logs_tx, _) = broadcast::channel(1024);
        Ok(Arc::new(State {
            config: RwLock::new(config),
            routes: RwLock::new(Arc::new(routes)),
            mock_store: tokio::sync::Mutex::new(MockStore::default()),
            mode: RwLock::new(Mode::Proxy),
            logs_tx,
            log_buffer: std::sync::Mutex::new(VecDeque::with_capacity(LOG_REPLAY_CAPACITY)),
            sequence: AtomicU64::new(0),
            restart_notify: tokio::sync::Notify::new(),
        }))
    }

    /// Block until a committed `update()` changed `port`/`ssl` (§5: "Config
    /// changes apply to requests accepted after the change commits"). The
    /// inbound accept loop in `server.rs` awaits this to know when to rebind.
    pub async fn wait_for_listener_restart(&self) {
        self.restart_notify.notified().await;
    }

    /// A consistent per-request snapshot: the configuration and its compiled
    /// routes as of the moment this is called.
    pub async fn snapshot(&self) -> (Configuration, Arc<Vec<Route>>) {
        let config = self.config.read().await.clone();
        let routes = self.routes.read().await.clone();
        (config, routes)
    }

    pub async fn mode(&self) -> Mode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: Mode) {
        *self.mode.write().await = mode;
    }

    /// §3 "mutated only through an `update(patch)` operation that applies
    /// the patch, diffs critical fields... and conditionally restarts the
    /// listener." Returns whether `port`/`ssl` changed, which `server.rs`
    /// uses to decide whether the listener needs to be rebound.
    pub async fn update(&self, patch: ConfigPatch) -> anyhow::Result<bool> {
        let new_routes = mapping::compile(&patch.new_config)?;

        let mut current = self.config.write().await;
        let listener_changed = current.port != patch.new_config.port
            || current.ssl.as_ref().map(|t| &t.cert) != patch.new_config.ssl.as_ref().map(|t| &t.cert)
            || current.ssl.as_ref().map(|t| &t.key) != patch.new_config.ssl.as_ref().map(|t| &t.key);

        *current = patch.new_config;
        drop(current);

        *self.routes.write().await = Arc::new(new_routes);

        if listener_changed {
            self.restart_notify.notify_waiters();
        }
        Ok(listener_changed)
    }

    pub fn publish_log(&self, line: String) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = LogEvent { sequence, line };

        {
            let mut buffer = self.log_buffer.lock().expect("log buffer mutex poisoned");
            if buffer.len() == LOG_REPLAY_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // A send error just means there are currently no *live* subscribers
        // right now; `replay_since` is what lets a reconnecting one catch up
        // on what it missed (§3 Recorder Buffer, §4.9).
        let _ = self.logs_tx.send(event);
        sequence
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.logs_tx.subscribe()
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// §4.9: "resumes missed records via a monotonic sequence number sent on
    /// reconnect." Returns every buffered event with `sequence > since`, in
    /// order; entries older than `LOG_REPLAY_CAPACITY` are gone for good.
    pub fn replay_since(&self, since: u64) -> Vec<LogEvent> {
        self.log_buffer
            .lock()
            .expect("log buffer mutex poisoned")
            .iter()
            .filter(|event| event.sequence > since)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    pub async fn snapshot_reflects_latest_committed_update() {
        let state = State::new(Configuration::default()).unwrap();
        let (before, _) = state.snapshot().await;
        assert_eq!(before.port, 8080);

        let mut patched = Configuration::default();
        patched.port = 9090;
        let restart_needed = state.update(ConfigPatch { new_config: patched }).await.unwrap();
        assert!(restart_needed);

        let (after, _) = state.snapshot().await;
        assert_eq!(after.port, 9090);
    }

    #[tokio::test]
    pub async fn update_without_port_or_tls_change_does_not_require_restart() {
        let state = State::new(Configuration::default()).unwrap();
        let mut patched = Configuration::default();
        patched.simple_logs = true;
        let restart_needed = state.update(ConfigPatch { new_config: patched }).await.unwrap();
        assert!(!restart_needed);
    }

    #[tokio::test]
    pub async fn logs_published_before_any_subscriber_are_simply_dropped() {
        let state = State::new(Configuration::default()).unwrap();
        let sequence = state.publish_log("no one is listening yet".to_string());
        assert_eq!(sequence, 1);
    }

    #[tokio::test]
    pub async fn subscriber_receives_published_log() {
        let state = State::new(Configuration::default()).unwrap();
        let mut receiver = state.subscribe_logs();
        state.publish_log("hello".to_string());
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.line, "hello");
    }

    #[tokio::test]
    pub async fn replay_since_returns_only_events_after_the_given_sequence() {
        let state = State::new(Configuration::default()).unwrap();
        state.publish_log("first".to_string());
        let second_seq = state.publish_log("second".to_string());
        state.publish_log("third".to_string());

        let missed = state.replay_since(second_seq - 1);
        assert_eq!(missed.len(), 2);
        assert_eq!(missed[0].line, "second");
        assert_eq!(missed[1].line, "third");

        assert!(state.replay_since(state.next_sequence()).is_empty());
    }

    #[tokio::test]
    pub async fn port_change_wakes_the_listener_restart_waiter() {
        let state = State::new(Configuration::default()).unwrap();
        let waiter = tokio::spawn({
            let state = state.clone();
            async move { state.wait_for_listener_restart().await }
        });

        let mut patched = Configuration::default();
        patched.port = 9091;
        state.update(ConfigPatch { new_config: patched }).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("restart waiter should have woken up")
            .unwrap();
    }
}
