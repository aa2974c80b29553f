use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use vigil_core::{ExecutionMode, QueueConfig, VigilError};
use vigil_review::{Completion, JobQueueManager, JobStatus, Outcome, ReviewHandler, ReviewJob};

/// Records every dispatched subject and leaves completion to the test.
struct Recorder {
    started: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ReviewHandler for Recorder {
    async fn dispatch(&self, job: &ReviewJob) -> Result<(), VigilError> {
        self.started.send(job.subject_ref.clone()).ok();
        Ok(())
    }
}

async fn next_start(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no dispatch")
        .expect("recorder dropped")
}

async fn wait_for_status(manager: &JobQueueManager, agent: &str, subject: &str, want: JobStatus) {
    for _ in 0..200 {
        if manager.job(agent, subject).map(|j| j.status) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{agent}/{subject} never reached {want}");
}

#[tokio::test]
async fn sequential_queue_advances_on_completion() {
    let manager = JobQueueManager::new(QueueConfig::default());
    let (tx, mut started) = mpsc::unbounded_channel();
    manager.register_handler("reviewer-a", Arc::new(Recorder { started: tx }));

    let first = manager.enqueue("reviewer-a", "pr-41").unwrap();
    assert!(first.queued);
    assert_eq!(first.position, Some(0));
    assert_eq!(next_start(&mut started).await, "pr-41");

    let second = manager.enqueue("reviewer-a", "pr-42").unwrap();
    assert!(second.queued);
    assert_eq!(second.position, Some(1));
    assert_eq!(manager.job("reviewer-a", "pr-41").unwrap().status, JobStatus::Running);
    assert_eq!(manager.job("reviewer-a", "pr-42").unwrap().status, JobStatus::Pending);

    let again = manager.enqueue("reviewer-a", "pr-42").unwrap();
    assert!(!again.queued);
    assert_eq!(again.position, None);

    assert!(manager.on_complete("reviewer-a", "pr-41", Outcome::Success));
    assert_eq!(next_start(&mut started).await, "pr-42");
    wait_for_status(&manager, "reviewer-a", "pr-42", JobStatus::Running).await;
    assert_eq!(manager.job("reviewer-a", "pr-41").unwrap().status, JobStatus::Done);

    let status = manager.status();
    let queue = status.queues.get("reviewer-a").copied().unwrap_or_default();
    assert_eq!(queue.pending, 0);
    assert_eq!(queue.running, 1);
}

#[tokio::test]
async fn completions_over_the_channel_drive_the_queue() {
    let manager = JobQueueManager::new(QueueConfig {
        mode: ExecutionMode::Sequential,
        ..QueueConfig::default()
    });
    let (tx, mut started) = mpsc::unbounded_channel();
    manager.register_handler("reviewer-a", Arc::new(Recorder { started: tx }));
    let listener = manager.spawn_completion_listener().expect("listener already taken");
    let completions = manager.completion_sender();

    manager.enqueue("reviewer-a", "pr-1").unwrap();
    manager.enqueue("reviewer-a", "pr-2").unwrap();
    assert_eq!(next_start(&mut started).await, "pr-1");

    completions
        .send(Completion {
            agent: "reviewer-a".into(),
            subject: "pr-1".into(),
            outcome: Outcome::Failure,
        })
        .unwrap();
    assert_eq!(next_start(&mut started).await, "pr-2");
    wait_for_status(&manager, "reviewer-a", "pr-1", JobStatus::Failed).await;

    listener.abort();
}
