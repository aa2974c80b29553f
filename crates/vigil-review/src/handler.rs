//! Review handlers the queue dispatches to.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};
use vigil_core::{RunnerConfig, VigilError};

use crate::pipeline::ReviewPipeline;
use crate::queue::{Completion, Outcome, ReviewHandler, ReviewJob};

/// Runs the in-process review pipeline on a task per job.
pub struct PipelineHandler {
    pipeline: Arc<ReviewPipeline>,
    completions: UnboundedSender<Completion>,
}

impl PipelineHandler {
    pub fn new(pipeline: Arc<ReviewPipeline>, completions: UnboundedSender<Completion>) -> Self {
        Self {
            pipeline,
            completions,
        }
    }
}

#[async_trait]
impl ReviewHandler for PipelineHandler {
    async fn dispatch(&self, job: &ReviewJob) -> Result<(), VigilError> {
        let pipeline = Arc::clone(&self.pipeline);
        let completions = self.completions.clone();
        let agent = job.agent_name.clone();
        let subject = job.subject_ref.clone();

        tokio::spawn(async move {
            let outcome = match pipeline.run(&subject).await {
                Ok(result) => {
                    info!(agent = %agent, subject = %subject, findings = result.findings.len(), "pipeline finished");
                    Outcome::Success
                }
                Err(e) => {
                    error!(agent = %agent, subject = %subject, error = %e, "pipeline failed");
                    Outcome::Failure
                }
            };
            report(&completions, agent, subject, outcome);
        });
        Ok(())
    }
}

/// Runs an external command per job and reports its exit status.
///
/// `{subject}` and `{agent}` in the configured arguments are replaced with
/// the job's values.
pub struct ProcessHandler {
    runner: RunnerConfig,
    completions: UnboundedSender<Completion>,
}

impl ProcessHandler {
    pub fn new(runner: RunnerConfig, completions: UnboundedSender<Completion>) -> Self {
        Self {
            runner,
            completions,
        }
    }

    /// Arguments for `job` with placeholders filled in.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use vigil_core::RunnerConfig;
    /// use vigil_review::handler::ProcessHandler;
    ///
    /// let (tx, _rx) = mpsc::unbounded_channel();
    /// let handler = ProcessHandler::new(
    ///     RunnerConfig { command: "runner".into(), args: vec!["--pr={subject}".into(), "{agent}".into()] },
    ///     tx,
    /// );
    /// assert_eq!(handler.args_for("acme/shop#4", "reviewer-a"), vec!["--pr=acme/shop#4", "reviewer-a"]);
    /// ```
    pub fn args_for(&self, subject: &str, agent: &str) -> Vec<String> {
        self.runner
            .args
            .iter()
            .map(|arg| arg.replace("{subject}", subject).replace("{agent}", agent))
            .collect()
    }
}

#[async_trait]
impl ReviewHandler for ProcessHandler {
    async fn dispatch(&self, job: &ReviewJob) -> Result<(), VigilError> {
        let args = self.args_for(&job.subject_ref, &job.agent_name);
        let mut child = Command::new(&self.runner.command)
            .args(&args)
            .env("VIGIL_AGENT", &job.agent_name)
            .env("VIGIL_SUBJECT", &job.subject_ref)
            .spawn()
            .map_err(|e| {
                VigilError::Handler(format!("failed to start {}: {e}", self.runner.command))
            })?;

        let completions = self.completions.clone();
        let agent = job.agent_name.clone();
        let subject = job.subject_ref.clone();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) if status.success() => Outcome::Success,
                Ok(status) => {
                    warn!(agent = %agent, subject = %subject, %status, "review runner exited unsuccessfully");
                    Outcome::Failure
                }
                Err(e) => {
                    error!(agent = %agent, subject = %subject, error = %e, "failed to wait for review runner");
                    Outcome::Failure
                }
            };
            report(&completions, agent, subject, outcome);
        });
        Ok(())
    }
}

fn report(completions: &UnboundedSender<Completion>, agent: String, subject: String, outcome: Outcome) {
    if completions
        .send(Completion {
            agent,
            subject,
            outcome,
        })
        .is_err()
    {
        warn!("completion listener is gone, result dropped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::queue::JobStatus;

    fn job(subject: &str) -> ReviewJob {
        ReviewJob {
            agent_name: "reviewer-a".into(),
            subject_ref: subject.into(),
            enqueued_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            status: JobStatus::Running,
        }
    }

    fn shell(script: &str) -> RunnerConfig {
        RunnerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn completion(rx: &mut mpsc::UnboundedReceiver<Completion>) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no completion reported")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn exit_status_becomes_outcome() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ok = ProcessHandler::new(shell("test \"$VIGIL_SUBJECT\" = pr-1"), tx.clone());
        ok.dispatch(&job("pr-1")).await.unwrap();
        let done = completion(&mut rx).await;
        assert_eq!(done.subject, "pr-1");
        assert_eq!(done.outcome, Outcome::Success);

        let failing = ProcessHandler::new(shell("exit 3"), tx);
        failing.dispatch(&job("pr-2")).await.unwrap();
        let done = completion(&mut rx).await;
        assert_eq!(done.agent, "reviewer-a");
        assert_eq!(done.outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn missing_command_fails_dispatch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = ProcessHandler::new(
            RunnerConfig {
                command: "/nonexistent/vigil-runner".into(),
                args: Vec::new(),
            },
            tx,
        );
        let err = handler.dispatch(&job("pr-1")).await.unwrap_err();
        assert!(matches!(err, VigilError::Handler(_)));
    }
}
