//! Review orchestration: job queues, cached instructions, and the pipeline.
//!
//! The [`queue::JobQueueManager`] admits review requests per agent and
//! dispatches them to a [`queue::ReviewHandler`]. The in-process handler runs
//! the [`pipeline::ReviewPipeline`], which pulls changed files from GitHub,
//! selects context, and asks the reasoning agent for findings using
//! instructions from the [`prompt::PromptCache`].

pub mod github;
pub mod handler;
pub mod pipeline;
pub mod prompt;
pub mod queue;

pub use handler::{PipelineHandler, ProcessHandler};
pub use pipeline::{ReviewOutcome, ReviewPipeline, ReviewStats};
pub use prompt::{InstructionBundle, Platform, PromptCache};
pub use queue::{
    Admission, AgentQueueStatus, Completion, JobQueueManager, JobStatus, Outcome, QueueStatus,
    ReviewHandler, ReviewJob,
};
