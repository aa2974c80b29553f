//! Per-agent review queues.
//!
//! Each agent gets a FIFO queue. In sequential mode an agent runs one job at
//! a time and the next job starts only after completion is reported. In
//! parallel mode jobs start on admission, bounded by `queue.max_parallel`
//! running jobs across all agents. Dispatch and completion are separate
//! events: handlers are started on spawned tasks and report back through
//! [`JobQueueManager::on_complete`] or the completion channel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_core::{ExecutionMode, QueueConfig, VigilError};

/// Lifecycle of a [`ReviewJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Whether the job still occupies its `(agent, subject)` slot.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One review of one subject by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewJob {
    pub agent_name: String,
    pub subject_ref: String,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

impl ReviewJob {
    fn new(agent_name: &str, subject_ref: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            subject_ref: subject_ref.to_string(),
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Pending,
        }
    }
}

/// Answer to an admission request.
///
/// `position` is `Some(0)` when the job started immediately, the 1-based
/// place among the agent's pending jobs when it waits, and `None` when no
/// job was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub queued: bool,
    pub position: Option<usize>,
}

/// How a dispatched job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Completion message delivered over the channel from
/// [`JobQueueManager::completion_sender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub agent: String,
    pub subject: String,
    pub outcome: Outcome,
}

/// Pending and running counts for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQueueStatus {
    pub pending: usize,
    pub running: usize,
}

/// Snapshot of every agent queue.
///
/// # Examples
///
/// ```
/// use vigil_review::queue::QueueStatus;
///
/// let status = QueueStatus::default();
/// assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"queues":{}}"#);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queues: BTreeMap<String, AgentQueueStatus>,
}

/// Starts the work for a job.
///
/// `dispatch` returns once the work has been started. The handler reports
/// the final result later through the completion channel or
/// [`JobQueueManager::on_complete`]. Returning `Err` fails the job at once.
#[async_trait]
pub trait ReviewHandler: Send + Sync {
    async fn dispatch(&self, job: &ReviewJob) -> Result<(), VigilError>;
}

#[derive(Default)]
struct AgentQueue {
    pending: VecDeque<ReviewJob>,
    running: Vec<ReviewJob>,
}

impl AgentQueue {
    fn holds(&self, subject: &str) -> bool {
        self.running.iter().any(|j| j.subject_ref == subject)
            || self.pending.iter().any(|j| j.subject_ref == subject)
    }
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, AgentQueue>,
    handlers: HashMap<String, Arc<dyn ReviewHandler>>,
    history: VecDeque<ReviewJob>,
}

type Dispatch = (Arc<dyn ReviewHandler>, ReviewJob);

struct Inner {
    config: QueueConfig,
    state: Mutex<State>,
    completions: mpsc::UnboundedSender<Completion>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
}

/// Admission, dispatch, and completion tracking for review jobs.
///
/// Cheap to clone; clones share the same queues. Must be used from within a
/// Tokio runtime because dispatch spawns tasks.
///
/// Admission dedupe is per process. Running several instances against the
/// same webhook source needs outside coordination.
#[derive(Clone)]
pub struct JobQueueManager {
    inner: Arc<Inner>,
}

impl JobQueueManager {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                completions: tx,
                receiver: Mutex::new(Some(rx)),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Register the handler that runs jobs for `agent`, replacing any previous one.
    pub fn register_handler(&self, agent: impl Into<String>, handler: Arc<dyn ReviewHandler>) {
        let agent = agent.into().trim().to_string();
        let mut state = self.lock();
        state.queues.entry(agent.clone()).or_default();
        state.handlers.insert(agent, handler);
    }

    /// Admit a review of `subject` by `agent`.
    ///
    /// A subject already pending or running for the agent is not queued
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::InvalidRequest`] when either identifier is empty
    /// or no handler is registered for the agent. No job is created.
    pub fn enqueue(&self, agent: &str, subject: &str) -> Result<Admission, VigilError> {
        let agent = agent.trim();
        let subject = subject.trim();
        if agent.is_empty() {
            return Err(VigilError::InvalidRequest("agent name is empty".into()));
        }
        if subject.is_empty() {
            return Err(VigilError::InvalidRequest("subject reference is empty".into()));
        }

        let (admission, dispatches) = {
            let mut state = self.lock();
            if !state.handlers.contains_key(agent) {
                return Err(VigilError::InvalidRequest(format!(
                    "no handler registered for agent {agent}"
                )));
            }

            let queue = state.queues.entry(agent.to_string()).or_default();
            if queue.holds(subject) {
                debug!(agent, subject, "duplicate review request ignored");
                return Ok(Admission {
                    queued: false,
                    position: None,
                });
            }
            queue.pending.push_back(ReviewJob::new(agent, subject));

            let dispatches = self.take_dispatchable(&mut state);
            let started = dispatches
                .iter()
                .any(|(_, job)| job.agent_name == agent && job.subject_ref == subject);
            let position = if started {
                0
            } else {
                state.queues[agent]
                    .pending
                    .iter()
                    .position(|j| j.subject_ref == subject)
                    .map_or(0, |i| i + 1)
            };
            (
                Admission {
                    queued: true,
                    position: Some(position),
                },
                dispatches,
            )
        };

        info!(agent, subject, position = ?admission.position, "review job admitted");
        self.spawn_dispatches(dispatches);
        Ok(admission)
    }

    /// Record the end of a running job and start whatever can start next.
    ///
    /// Returns `false`, changing nothing, when the subject is not running for
    /// the agent, so repeated deliveries are harmless.
    pub fn on_complete(&self, agent: &str, subject: &str, outcome: impl Into<Outcome>) -> bool {
        let (agent, subject) = (agent.trim(), subject.trim());
        let outcome = outcome.into();
        let status = match outcome {
            Outcome::Success => JobStatus::Done,
            Outcome::Failure => JobStatus::Failed,
        };

        let dispatches = {
            let mut state = self.lock();
            let Some(job) = remove_running(&mut state, agent, subject) else {
                debug!(agent, subject, "completion for a job that is not running");
                return false;
            };
            self.archive(&mut state, job, status);
            self.take_dispatchable(&mut state)
        };

        info!(agent, subject, status = %status, "review job finished");
        self.spawn_dispatches(dispatches);
        true
    }

    /// Pending and running counts per registered agent.
    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            queues: state
                .queues
                .iter()
                .map(|(agent, q)| {
                    (
                        agent.clone(),
                        AgentQueueStatus {
                            pending: q.pending.len(),
                            running: q.running.len(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// The live job for `(agent, subject)`, or the most recent finished one.
    pub fn job(&self, agent: &str, subject: &str) -> Option<ReviewJob> {
        let (agent, subject) = (agent.trim(), subject.trim());
        let state = self.lock();
        let matches = |j: &&ReviewJob| j.agent_name == agent && j.subject_ref == subject;
        state
            .queues
            .get(agent)
            .and_then(|q| q.running.iter().chain(q.pending.iter()).find(matches))
            .or_else(|| state.history.iter().rev().find(matches))
            .cloned()
    }

    /// A sender handlers can use to report completion from anywhere.
    pub fn completion_sender(&self) -> mpsc::UnboundedSender<Completion> {
        self.inner.completions.clone()
    }

    /// Feed the completion channel into [`on_complete`](Self::on_complete).
    ///
    /// Returns `None` if a listener is already running.
    pub fn spawn_completion_listener(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let manager = self.clone();
        Some(tokio::spawn(async move {
            while let Some(done) = receiver.recv().await {
                manager.on_complete(&done.agent, &done.subject, done.outcome);
            }
        }))
    }

    /// Fail running jobs older than `queue.stale_after` and advance their queues.
    ///
    /// Returns the jobs that were failed.
    pub fn reap_stale(&self) -> Vec<ReviewJob> {
        let stale_after = chrono::Duration::from_std(self.inner.config.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let (reaped, dispatches) = {
            let mut state = self.lock();
            let mut stale = Vec::new();
            for queue in state.queues.values_mut() {
                let (old, fresh): (Vec<ReviewJob>, Vec<ReviewJob>) =
                    queue.running.drain(..).partition(|job| {
                        job.started_at
                            .is_some_and(|started| now - started >= stale_after)
                    });
                queue.running = fresh;
                stale.extend(old);
            }

            let mut reaped = Vec::with_capacity(stale.len());
            for job in stale {
                warn!(
                    agent = %job.agent_name,
                    subject = %job.subject_ref,
                    "no completion reported in time, failing job"
                );
                reaped.push(self.archive(&mut state, job, JobStatus::Failed));
            }
            let dispatches = self.take_dispatchable(&mut state);
            (reaped, dispatches)
        };

        self.spawn_dispatches(dispatches);
        reaped
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval`.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.reap_stale();
            }
        })
    }

    /// Move jobs from pending to running as the execution mode allows.
    fn take_dispatchable(&self, state: &mut State) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let State {
            queues, handlers, ..
        } = state;

        match self.inner.config.mode {
            ExecutionMode::Sequential => {
                for (agent, queue) in queues.iter_mut() {
                    if !queue.running.is_empty() {
                        continue;
                    }
                    if let Some(dispatch) = start_next(agent, queue, handlers) {
                        dispatches.push(dispatch);
                    }
                }
            }
            ExecutionMode::Parallel => {
                let limit = self.inner.config.max_parallel.max(1);
                let mut running: usize = queues.values().map(|q| q.running.len()).sum();
                // Round-robin across agents so one busy agent cannot take every slot.
                while running < limit {
                    let mut started = false;
                    for (agent, queue) in queues.iter_mut() {
                        if running >= limit {
                            break;
                        }
                        if let Some(dispatch) = start_next(agent, queue, handlers) {
                            dispatches.push(dispatch);
                            running += 1;
                            started = true;
                        }
                    }
                    if !started {
                        break;
                    }
                }
            }
        }
        dispatches
    }

    fn spawn_dispatches(&self, dispatches: Vec<Dispatch>) {
        for (handler, job) in dispatches {
            let manager = self.clone();
            tokio::spawn(async move {
                info!(agent = %job.agent_name, subject = %job.subject_ref, "dispatching review job");
                if let Err(e) = handler.dispatch(&job).await {
                    error!(
                        agent = %job.agent_name,
                        subject = %job.subject_ref,
                        error = %e,
                        "review handler failed"
                    );
                    manager.on_complete(&job.agent_name, &job.subject_ref, Outcome::Failure);
                }
            });
        }
    }

    fn archive(&self, state: &mut State, mut job: ReviewJob, status: JobStatus) -> ReviewJob {
        job.status = status;
        job.finished_at = Some(Utc::now());
        state.history.push_back(job.clone());
        while state.history.len() > self.inner.config.history_limit {
            state.history.pop_front();
        }
        job
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn start_next(
    agent: &str,
    queue: &mut AgentQueue,
    handlers: &HashMap<String, Arc<dyn ReviewHandler>>,
) -> Option<Dispatch> {
    let handler = handlers.get(agent)?.clone();
    let mut job = queue.pending.pop_front()?;
    job.status = JobStatus::Running;
    job.started_at = Some(Utc::now());
    queue.running.push(job.clone());
    Some((handler, job))
}

fn remove_running(state: &mut State, agent: &str, subject: &str) -> Option<ReviewJob> {
    let queue = state.queues.get_mut(agent)?;
    let idx = queue.running.iter().position(|j| j.subject_ref == subject)?;
    Some(queue.running.remove(idx))
}
