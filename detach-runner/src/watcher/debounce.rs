use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use detach_core::domain::JobId;

/// Coalesces bursts of change notifications per job
///
/// The first change of a quiet job is delivered right away. Changes that
/// arrive within `window` of the last delivery are held back and delivered
/// once, when the window has passed.
#[derive(Debug)]
pub(crate) struct Debouncer {
    window: Duration,
    pending: HashSet<JobId>,
    last_fired: HashMap<JobId, Instant>,
}

impl Debouncer {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashSet::new(),
            last_fired: HashMap::new(),
        }
    }

    pub(crate) fn record(&mut self, job_id: JobId) {
        self.pending.insert(job_id);
    }

    /// Jobs whose pending change may be delivered at `now`
    pub(crate) fn due(&mut self, now: Instant) -> Vec<JobId> {
        let window = self.window;
        let last_fired = &self.last_fired;

        let mut ready: Vec<JobId> = self
            .pending
            .iter()
            .filter(|job_id| {
                last_fired
                    .get(*job_id)
                    .is_none_or(|fired| now.saturating_duration_since(*fired) >= window)
            })
            .cloned()
            .collect();
        ready.sort();

        for job_id in &ready {
            self.pending.remove(job_id);
            self.last_fired.insert(job_id.clone(), now);
        }

        ready
    }

    /// Drops bookkeeping for jobs that are no longer watched
    pub(crate) fn retain(&mut self, watched: &[JobId]) {
        self.pending.retain(|job_id| watched.contains(job_id));
        self.last_fired.retain(|job_id, _| watched.contains(job_id));
    }
}
