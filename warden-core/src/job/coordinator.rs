//! Per-pattern job queues

use std::collections::{HashMap, VecDeque};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;
use warden_ipc::ProcessId;
use warden_storage::{origin_of, VersionId};

use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::registration::RegistrationInfo;

pub type JobId = u64;

/// Completion callback shared by every caller of a job
pub type RegistrationCallback = Box<dyn FnOnce(ServiceWorkerResult<Option<RegistrationInfo>>) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Register { script_url: Url },
    Unregister,
}

/// Outcome of scheduling a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled {
    /// An equal job was already last in the queue; the caller joined it.
    /// `lend_to` names the version that should take the caller's process
    /// reference right away.
    Joined {
        job_id: JobId,
        lend_to: Option<VersionId>,
    },
    /// A new job was queued; `runnable` when it is first in its queue
    Queued { job_id: JobId, runnable: bool },
}

/// One queued or running job
pub struct JobEntry {
    pub job_id: JobId,
    pub kind: JobKind,
    pub pattern: Url,
    pub callbacks: Vec<RegistrationCallback>,
    /// Process ids waiting for the job's version to exist
    pub pending_process_ids: Vec<ProcessId>,
    /// Process ids lent to the job's version, released on completion
    pub lent_process_ids: Vec<ProcessId>,
    pub pending_version: Option<VersionId>,
    pub task: Option<JoinHandle<()>>,
}

/// Serialises register and unregister jobs per scope pattern.
///
/// Jobs for one pattern run one at a time in arrival order. A job that
/// equals the last queued job for its pattern is not queued again: the new
/// caller's callback joins the existing job.
///
/// While an origin is held no job for it may run; queued jobs wait for the
/// last hold to be released.
pub struct JobCoordinator {
    queues: HashMap<Url, VecDeque<JobEntry>>,
    held_origins: HashMap<String, usize>,
    next_job_id: JobId,
}

impl Default for JobCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobCoordinator {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            held_origins: HashMap::new(),
            next_job_id: 1,
        }
    }

    pub fn schedule(
        &mut self,
        kind: JobKind,
        pattern: Url,
        process_id: Option<ProcessId>,
        callback: RegistrationCallback,
    ) -> Scheduled {
        let queue = self.queues.entry(pattern.clone()).or_default();

        if let Some(last) = queue.back_mut() {
            if last.kind == kind {
                debug!("Joining job {} for {}", last.job_id, pattern);
                last.callbacks.push(callback);
                let mut lend_to = None;
                if let Some(process_id) = process_id {
                    match last.pending_version {
                        Some(version_id) => {
                            last.lent_process_ids.push(process_id);
                            lend_to = Some(version_id);
                        }
                        None => last.pending_process_ids.push(process_id),
                    }
                }
                return Scheduled::Joined {
                    job_id: last.job_id,
                    lend_to,
                };
            }
        }

        let job_id = self.next_job_id;
        self.next_job_id += 1;
        queue.push_back(JobEntry {
            job_id,
            kind,
            pattern,
            callbacks: vec![callback],
            pending_process_ids: process_id.into_iter().collect(),
            lent_process_ids: Vec::new(),
            pending_version: None,
            task: None,
        });
        Scheduled::Queued {
            job_id,
            runnable: queue.len() == 1,
        }
    }

    /// The job at the front of `pattern`'s queue
    pub fn front(&self, pattern: &Url) -> Option<&JobEntry> {
        self.queues.get(pattern).and_then(|queue| queue.front())
    }

    pub fn is_running(&self, pattern: &Url, job_id: JobId) -> bool {
        self.front(pattern)
            .map(|job| job.job_id == job_id)
            .unwrap_or(false)
    }

    pub fn set_task(&mut self, pattern: &Url, job_id: JobId, task: JoinHandle<()>) {
        match self.front_mut(pattern, job_id) {
            Some(job) => job.task = Some(task),
            None => task.abort(),
        }
    }

    /// Record the version a job is installing. Returns the process ids
    /// that should be lent to it now.
    pub fn set_pending_version(
        &mut self,
        pattern: &Url,
        job_id: JobId,
        version_id: VersionId,
    ) -> Vec<ProcessId> {
        let Some(job) = self.front_mut(pattern, job_id) else {
            return Vec::new();
        };
        job.pending_version = Some(version_id);
        let lent = std::mem::take(&mut job.pending_process_ids);
        job.lent_process_ids.extend(lent.iter().copied());
        lent
    }

    /// Remove a finished job from the front of its queue
    pub fn finish(&mut self, pattern: &Url, job_id: JobId) -> Option<JobEntry> {
        let queue = self.queues.get_mut(pattern)?;
        if queue.front().map(|job| job.job_id) != Some(job_id) {
            return None;
        }
        let job = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(pattern);
        }
        job
    }

    /// Remove every job, stopping running ones. Callers are completed with
    /// `Abort`.
    pub fn abort_all(&mut self) -> Vec<JobEntry> {
        let mut aborted = Vec::new();
        for (_, queue) in self.queues.drain() {
            for mut job in queue {
                if let Some(task) = job.task.take() {
                    task.abort();
                }
                for callback in std::mem::take(&mut job.callbacks) {
                    callback(Err(ServiceWorkerError::Abort));
                }
                aborted.push(job);
            }
        }
        aborted
    }

    /// Hold `origin`: abort its running jobs and keep the rest queued
    /// until `release_origin`. The aborted jobs are returned with their
    /// task handles so the caller can wait for them to wind down.
    pub fn hold_origin(&mut self, origin: &str) -> Vec<JobEntry> {
        *self.held_origins.entry(origin.to_string()).or_default() += 1;

        let mut aborted = Vec::new();
        self.queues.retain(|pattern, queue| {
            if origin_of(pattern).as_deref() != Some(origin) {
                return true;
            }
            let running = queue.front().is_some_and(|job| job.task.is_some());
            if let Some(mut job) = running.then(|| queue.pop_front()).flatten() {
                debug!("Aborting job {} for {}", job.job_id, pattern);
                if let Some(task) = &job.task {
                    task.abort();
                }
                for callback in std::mem::take(&mut job.callbacks) {
                    callback(Err(ServiceWorkerError::Abort));
                }
                aborted.push(job);
            }
            !queue.is_empty()
        });
        aborted
    }

    /// Drop one hold on `origin`. Once none remain, returns the patterns
    /// whose queued jobs may start.
    pub fn release_origin(&mut self, origin: &str) -> Vec<Url> {
        match self.held_origins.get_mut(origin) {
            Some(holds) if *holds > 1 => {
                *holds -= 1;
                return Vec::new();
            }
            Some(_) => {
                self.held_origins.remove(origin);
            }
            None => return Vec::new(),
        }
        self.queues
            .keys()
            .filter(|pattern| origin_of(pattern).as_deref() == Some(origin))
            .cloned()
            .collect()
    }

    /// Whether jobs for `pattern` are currently kept from running
    pub fn is_held(&self, pattern: &Url) -> bool {
        origin_of(pattern)
            .map(|origin| self.held_origins.contains_key(&origin))
            .unwrap_or(false)
    }

    pub fn job_count(&self) -> usize {
        self.queues.values().map(|queue| queue.len()).sum()
    }

    fn front_mut(&mut self, pattern: &Url, job_id: JobId) -> Option<&mut JobEntry> {
        self.queues
            .get_mut(pattern)
            .and_then(|queue| queue.front_mut())
            .filter(|job| job.job_id == job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn pattern() -> Url {
        Url::parse("https://example.com/app/*").unwrap()
    }

    fn register(name: &str) -> JobKind {
        JobKind::Register {
            script_url: Url::parse("https://example.com/app/").unwrap().join(name).unwrap(),
        }
    }

    type Outcomes = Arc<Mutex<Vec<ServiceWorkerResult<Option<RegistrationInfo>>>>>;

    fn recorder(outcomes: &Outcomes) -> RegistrationCallback {
        let outcomes = outcomes.clone();
        Box::new(move |result| outcomes.lock().unwrap().push(result))
    }

    #[test]
    fn test_equal_jobs_coalesce() {
        let mut coordinator = JobCoordinator::new();
        let outcomes = Outcomes::default();

        let first = coordinator.schedule(
            register("a.js"),
            pattern(),
            Some(4),
            recorder(&outcomes),
        );
        assert_eq!(
            first,
            Scheduled::Queued {
                job_id: 1,
                runnable: true
            }
        );

        let second = coordinator.schedule(
            register("a.js"),
            pattern(),
            Some(5),
            recorder(&outcomes),
        );
        assert_eq!(
            second,
            Scheduled::Joined {
                job_id: 1,
                lend_to: None
            }
        );
        assert_eq!(coordinator.job_count(), 1);

        let lent = coordinator.set_pending_version(&pattern(), 1, 10);
        assert_eq!(lent, vec![4, 5]);

        let third = coordinator.schedule(
            register("a.js"),
            pattern(),
            Some(6),
            recorder(&outcomes),
        );
        assert_eq!(
            third,
            Scheduled::Joined {
                job_id: 1,
                lend_to: Some(10)
            }
        );

        let job = coordinator.finish(&pattern(), 1).unwrap();
        assert_eq!(job.callbacks.len(), 3);
        assert_eq!(job.lent_process_ids, vec![4, 5, 6]);
        assert_eq!(coordinator.job_count(), 0);
    }

    #[test]
    fn test_different_jobs_queue_in_order() {
        let mut coordinator = JobCoordinator::new();
        let outcomes = Outcomes::default();

        coordinator.schedule(
            register("a.js"),
            pattern(),
            None,
            recorder(&outcomes),
        );
        let second = coordinator.schedule(
            register("b.js"),
            pattern(),
            None,
            recorder(&outcomes),
        );
        let third = coordinator.schedule(
            JobKind::Unregister,
            pattern(),
            None,
            recorder(&outcomes),
        );
        assert_eq!(
            second,
            Scheduled::Queued {
                job_id: 2,
                runnable: false
            }
        );
        assert_eq!(
            third,
            Scheduled::Queued {
                job_id: 3,
                runnable: false
            }
        );

        assert!(coordinator.finish(&pattern(), 2).is_none());
        assert!(coordinator.finish(&pattern(), 1).is_some());
        assert!(coordinator.is_running(&pattern(), 2));
        assert_eq!(coordinator.front(&pattern()).unwrap().kind, register("b.js"));
    }

    #[test]
    fn test_abort_all_completes_callbacks() {
        let mut coordinator = JobCoordinator::new();
        let outcomes = Outcomes::default();
        coordinator.schedule(
            register("a.js"),
            pattern(),
            None,
            recorder(&outcomes),
        );
        coordinator.schedule(
            JobKind::Unregister,
            Url::parse("https://example.com/other/").unwrap(),
            None,
            recorder(&outcomes),
        );

        let aborted = coordinator.abort_all();
        assert_eq!(aborted.len(), 2);
        assert_eq!(coordinator.job_count(), 0);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|outcome| outcome == &Err(ServiceWorkerError::Abort)));
    }

    #[tokio::test]
    async fn test_held_origin_aborts_running_and_defers_queued() {
        let mut coordinator = JobCoordinator::new();
        let outcomes = Outcomes::default();
        let other = Url::parse("https://other.example/*").unwrap();

        coordinator.schedule(register("a.js"), pattern(), None, recorder(&outcomes));
        coordinator.set_task(&pattern(), 1, tokio::spawn(std::future::pending::<()>()));
        coordinator.schedule(register("b.js"), pattern(), None, recorder(&outcomes));
        coordinator.schedule(JobKind::Unregister, other.clone(), None, recorder(&outcomes));
        coordinator.set_task(&other, 3, tokio::spawn(std::future::pending::<()>()));

        let mut aborted = coordinator.hold_origin("https://example.com");
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].job_id, 1);
        let task = aborted[0].task.take().unwrap();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![Err(ServiceWorkerError::Abort)]
        );

        // The queued job waits; the other origin is untouched
        assert!(coordinator.is_held(&pattern()));
        assert!(!coordinator.is_held(&other));
        assert_eq!(coordinator.front(&pattern()).unwrap().job_id, 2);
        assert!(coordinator.is_running(&other, 3));

        // A second hold keeps the origin blocked after the first release
        coordinator.hold_origin("https://example.com");
        assert!(coordinator
            .release_origin("https://example.com")
            .is_empty());
        assert!(coordinator.is_held(&pattern()));
        assert_eq!(
            coordinator.release_origin("https://example.com"),
            vec![pattern()]
        );
        assert!(!coordinator.is_held(&pattern()));
        assert_eq!(coordinator.job_count(), 2);
    }
}
