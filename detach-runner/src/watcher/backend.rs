//! Change sources for the watcher thread
//!
//! Both sources report the job ids whose state file changed since the
//! previous call. An `Err` means the source can no longer be trusted and
//! the caller should fall back to polling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use detach_core::domain::JobId;
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

use crate::atomic;
use crate::state_store::EXTENSION;

pub(crate) trait ChangeSource: Send {
    fn name(&self) -> &'static str;

    /// Jobs among `watched` whose state file changed; never blocks for long
    fn changes(&mut self, watched: &[JobId]) -> Result<Vec<JobId>, String>;
}

/// Kernel notifications on the State Store directory
pub(crate) struct InotifySource {
    inotify: Inotify,
}

impl InotifySource {
    pub(crate) fn new(dir: &Path) -> Result<Self, String> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| format!("inotify init failed: {e}"))?;

        // atomic writes surface as IN_MOVED_TO on the final name
        let mask = AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE;
        inotify
            .add_watch(dir, mask)
            .map_err(|e| format!("inotify add watch on {} failed: {e}", dir.display()))?;

        Ok(Self { inotify })
    }
}

impl ChangeSource for InotifySource {
    fn name(&self) -> &'static str {
        "inotify"
    }

    fn changes(&mut self, watched: &[JobId]) -> Result<Vec<JobId>, String> {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return Ok(Vec::new()),
            Err(e) => return Err(format!("inotify read failed: {e}")),
        };

        let mut changed = Vec::new();
        for event in events {
            if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                return Err("inotify queue overflow (events may be lost)".to_string());
            }
            if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                return Err("state directory is no longer watched".to_string());
            }

            let Some(job_id) = event.name.and_then(|name| job_for_file(&name.to_string_lossy()))
            else {
                continue;
            };
            if watched.contains(&job_id) && !changed.contains(&job_id) {
                changed.push(job_id);
            }
        }

        Ok(changed)
    }
}

fn job_for_file(name: &str) -> Option<JobId> {
    if atomic::is_temp_file(name) {
        return None;
    }
    let stem = name.strip_suffix(EXTENSION)?.strip_suffix('.')?;
    JobId::new(stem).ok()
}

/// What a poll remembers about one state file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// Fixed-interval comparison of file metadata
pub(crate) struct PollSource {
    dir: PathBuf,
    interval: Duration,
    last_poll: Option<Instant>,
    seen: HashMap<JobId, Option<Fingerprint>>,
}

impl PollSource {
    pub(crate) fn new(dir: &Path, interval: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            interval,
            last_poll: None,
            seen: HashMap::new(),
        }
    }

    fn fingerprint(&self, job_id: &JobId) -> Option<Fingerprint> {
        let meta = fs::metadata(self.dir.join(format!("{job_id}.{EXTENSION}"))).ok()?;
        Some(Fingerprint {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

impl ChangeSource for PollSource {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn changes(&mut self, watched: &[JobId]) -> Result<Vec<JobId>, String> {
        let now = Instant::now();
        if self
            .last_poll
            .is_some_and(|last| now.saturating_duration_since(last) < self.interval)
        {
            return Ok(Vec::new());
        }
        self.last_poll = Some(now);

        self.seen.retain(|job_id, _| watched.contains(job_id));

        let mut changed = Vec::new();
        for job_id in watched {
            let current = self.fingerprint(job_id);
            match self.seen.insert(job_id.clone(), current) {
                // first sight establishes the baseline
                None => {}
                Some(previous) if previous != current => changed.push(job_id.clone()),
                Some(_) => {}
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    #[test]
    fn test_job_for_file() {
        assert_eq!(job_for_file("j1.json"), Some(id("j1")));
        assert_eq!(job_for_file(".j1.json.12.0.tmp"), None);
        assert_eq!(job_for_file("j1.pid"), None);
        assert_eq!(job_for_file("json"), None);
    }

    #[test]
    fn test_poll_source_reports_changes_after_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = vec![id("j1")];
        let mut source = PollSource::new(tmp.path(), Duration::ZERO);

        assert!(source.changes(&watched).unwrap().is_empty());

        fs::write(tmp.path().join("j1.json"), b"{}").unwrap();
        assert_eq!(source.changes(&watched).unwrap(), vec![id("j1")]);
        assert!(source.changes(&watched).unwrap().is_empty());

        fs::remove_file(tmp.path().join("j1.json")).unwrap();
        assert_eq!(source.changes(&watched).unwrap(), vec![id("j1")]);
    }

    #[test]
    fn test_poll_source_respects_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = vec![id("j1")];
        let mut source = PollSource::new(tmp.path(), Duration::from_secs(3600));

        source.changes(&watched).unwrap();
        fs::write(tmp.path().join("j1.json"), b"{}").unwrap();
        assert!(source.changes(&watched).unwrap().is_empty());
    }

    #[test]
    fn test_inotify_source_sees_atomic_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let Ok(mut source) = InotifySource::new(tmp.path()) else {
            return;
        };
        let watched = vec![id("j1")];

        atomic::write_atomic(&tmp.path().join("j1.json"), b"{}").unwrap();
        atomic::write_atomic(&tmp.path().join("other.json"), b"{}").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(source.changes(&watched).unwrap(), vec![id("j1")]);
        assert!(source.changes(&watched).unwrap().is_empty());
    }
}
