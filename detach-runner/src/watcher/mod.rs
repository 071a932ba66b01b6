//! Change Watcher
//!
//! Observes the State Store directory and invokes per-job callbacks when a
//! job's state file changes. Deliveries are debounced per job. When kernel
//! notifications are unavailable or stop being reliable, the watcher keeps
//! delivering through fixed-interval polling; callers are not told which
//! mode is active beyond [`StateWatcher::is_polling`].

mod backend;
mod debounce;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use detach_core::Result;
use detach_core::config::{RuntimeConfig, WatchMode};
use detach_core::domain::{JobId, JobState};
use detach_core::Error;
use tracing::{debug, info, warn};

use crate::state_store::StateStore;
use backend::{ChangeSource, InotifySource, PollSource};
use debounce::Debouncer;

/// How often the watcher thread wakes up to drain events and check for stop
const TICK: Duration = Duration::from_millis(20);

/// Invoked with the job id and its latest state (`None` once the file is gone)
pub type Callback = Arc<dyn Fn(&JobId, Option<&JobState>) + Send + Sync>;

#[derive(Default)]
struct Shared {
    callbacks: Mutex<HashMap<JobId, Vec<Callback>>>,
    stop: AtomicBool,
    polling: AtomicBool,
}

impl Shared {
    fn watched(&self) -> Vec<JobId> {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.keys().cloned().collect()
    }

    fn callbacks_for(&self, job_id: &JobId) -> Vec<Callback> {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.get(job_id).cloned().unwrap_or_default()
    }
}

/// Debounced change notifications for State Store files
pub struct StateWatcher {
    store: StateStore,
    mode: WatchMode,
    debounce: Duration,
    poll_interval: Duration,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl StateWatcher {
    pub fn new(store: StateStore) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            store,
            mode: defaults.watch_mode,
            debounce: defaults.debounce,
            poll_interval: defaults.poll_interval,
            shared: Arc::new(Shared::default()),
            handle: None,
        }
    }

    pub fn from_config(store: StateStore, config: &RuntimeConfig) -> Self {
        Self::new(store)
            .with_mode(config.watch_mode)
            .with_debounce(config.debounce)
            .with_poll_interval(config.poll_interval)
    }

    pub fn with_mode(mut self, mode: WatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Adds a callback for `job_id`; several callbacks per job are allowed
    pub fn register_callback<F>(&self, job_id: JobId, callback: F)
    where
        F: Fn(&JobId, Option<&JobState>) + Send + Sync + 'static,
    {
        let mut callbacks = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.entry(job_id).or_default().push(Arc::new(callback));
    }

    /// Removes every callback of `job_id`, returning whether any existed
    pub fn unregister(&self, job_id: &JobId) -> bool {
        let mut callbacks = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.remove(job_id).is_some()
    }

    pub fn watched(&self) -> Vec<JobId> {
        self.shared.watched()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether deliveries currently come from polling
    pub fn is_polling(&self) -> bool {
        self.shared.polling.load(Ordering::SeqCst)
    }

    /// Starts the watcher thread; calling it again while running is a no-op
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let source = self.open_source();
        self.shared.stop.store(false, Ordering::SeqCst);

        let store = self.store.clone();
        let shared = Arc::clone(&self.shared);
        let debounce = self.debounce;
        let poll_interval = self.poll_interval;

        let handle = std::thread::Builder::new()
            .name("detach-watcher".to_string())
            .spawn(move || watch_loop(store, shared, source, debounce, poll_interval))
            .map_err(Error::Io)?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stops the watcher thread and releases the notification handle
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shared.stop.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            warn!("State watcher thread panicked");
        }
        debug!("State watcher stopped");
    }

    fn open_source(&self) -> Box<dyn ChangeSource> {
        let dir = self.store.dir();

        if self.mode == WatchMode::Auto {
            match InotifySource::new(dir) {
                Ok(source) => {
                    self.shared.polling.store(false, Ordering::SeqCst);
                    info!("Watching {} with inotify", dir.display());
                    return Box::new(source);
                }
                Err(reason) => warn!("{}; falling back to polling", reason),
            }
        }

        self.shared.polling.store(true, Ordering::SeqCst);
        info!(
            "Polling {} every {:?}",
            dir.display(),
            self.poll_interval
        );
        Box::new(PollSource::new(dir, self.poll_interval))
    }
}

impl Drop for StateWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(
    store: StateStore,
    shared: Arc<Shared>,
    mut source: Box<dyn ChangeSource>,
    debounce: Duration,
    poll_interval: Duration,
) {
    let mut debouncer = Debouncer::new(debounce);

    while !shared.stop.load(Ordering::SeqCst) {
        let watched = shared.watched();
        debouncer.retain(&watched);

        match source.changes(&watched) {
            Ok(changed) => {
                for job_id in changed {
                    debouncer.record(job_id);
                }
            }
            Err(reason) => {
                warn!(
                    "{} watcher degraded ({}); falling back to polling",
                    source.name(),
                    reason
                );
                source = Box::new(PollSource::new(store.dir(), poll_interval));
                shared.polling.store(true, Ordering::SeqCst);
                // events may have been lost; resynchronise every watched job
                for job_id in watched {
                    debouncer.record(job_id);
                }
            }
        }

        for job_id in debouncer.due(Instant::now()) {
            dispatch(&store, &shared, &job_id);
        }

        std::thread::sleep(TICK);
    }
}

fn dispatch(store: &StateStore, shared: &Shared, job_id: &JobId) {
    let callbacks = shared.callbacks_for(job_id);
    if callbacks.is_empty() {
        return;
    }

    let state = match store.read(job_id) {
        Ok(state) => Some(state),
        Err(Error::NotFound(_)) => None,
        Err(e) => {
            warn!("Watcher could not read job {}: {}", job_id, e);
            return;
        }
    };

    for callback in callbacks {
        callback(job_id, state.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use detach_core::domain::{JobStatus, StateUpdate};
    use std::sync::atomic::AtomicUsize;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn setup(mode: WatchMode) -> (tempfile::TempDir, StateStore, StateWatcher) {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path().join("state")).unwrap();
        store.write(&JobState::initializing(id("j1"), Utc::now())).unwrap();

        let watcher = StateWatcher::new(store.clone())
            .with_mode(mode)
            .with_poll_interval(Duration::from_millis(50));
        (tmp, store, watcher)
    }

    fn counter(watcher: &StateWatcher, job: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        watcher.register_callback(id(job), move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_two_listeners_fire_once_per_update() {
        let (_tmp, store, mut watcher) = setup(WatchMode::Auto);
        let first = counter(&watcher, "j1");
        let second = counter(&watcher, "j1");

        watcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));

        store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Running).with_pid(42))
            .unwrap();
        std::thread::sleep(Duration::from_millis(400));
        watcher.stop();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_burst_delivers_latest_state() {
        let (_tmp, store, mut watcher) = setup(WatchMode::Auto);
        let calls = Arc::new(AtomicUsize::new(0));
        let last_step = Arc::new(Mutex::new(None::<String>));
        {
            let calls = Arc::clone(&calls);
            let last_step = Arc::clone(&last_step);
            watcher.register_callback(id("j1"), move |_, state| {
                calls.fetch_add(1, Ordering::SeqCst);
                *last_step.lock().unwrap() = state.and_then(|s| s.current_step.clone());
            });
        }

        watcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));

        for step in 0..5 {
            store
                .update(&id("j1"), &StateUpdate::default().with_step(format!("s{step}")))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(500));
        watcher.stop();

        let calls = calls.load(Ordering::SeqCst);
        assert!((1..=2).contains(&calls), "got {calls} deliveries");
        assert_eq!(last_step.lock().unwrap().as_deref(), Some("s4"));
    }

    #[test]
    fn test_forced_polling_still_delivers() {
        let (_tmp, store, mut watcher) = setup(WatchMode::Poll);
        let count = counter(&watcher, "j1");

        watcher.start().unwrap();
        assert!(watcher.is_polling());
        std::thread::sleep(Duration::from_millis(150));

        store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Failed))
            .unwrap();
        std::thread::sleep(Duration::from_millis(400));
        watcher.stop();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_job_is_not_delivered() {
        let (_tmp, store, mut watcher) = setup(WatchMode::Auto);
        let count = counter(&watcher, "j1");
        assert!(watcher.unregister(&id("j1")));
        assert!(!watcher.unregister(&id("j1")));

        watcher.start().unwrap();
        store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Running))
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        watcher.stop();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deleted_state_is_delivered_as_none() {
        let (_tmp, store, mut watcher) = setup(WatchMode::Auto);
        let saw_none = Arc::new(AtomicBool::new(false));
        {
            let saw_none = Arc::clone(&saw_none);
            watcher.register_callback(id("j1"), move |_, state| {
                if state.is_none() {
                    saw_none.store(true, Ordering::SeqCst);
                }
            });
        }

        watcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        store.delete(&id("j1")).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        watcher.stop();

        assert!(saw_none.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (_tmp, _store, mut watcher) = setup(WatchMode::Auto);

        watcher.start().unwrap();
        watcher.start().unwrap();
        assert!(watcher.is_running());

        watcher.stop();
        watcher.stop();
        assert!(!watcher.is_running());

        watcher.start().unwrap();
        drop(watcher);
    }
}
