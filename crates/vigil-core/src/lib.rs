//! Core types, configuration, and error handling for the Vigil engine.
//!
//! This crate provides the shared foundation used by all other Vigil crates:
//! - [`VigilError`]: unified error type using `thiserror`
//! - [`VigilConfig`]: configuration loaded from `.vigil.toml`
//! - Shared types: [`ChangedFile`], [`FileContext`], [`SymbolTable`],
//!   [`Finding`], [`Severity`], [`SearchHit`]
//! - Collaborator traits: [`SourceControl`], [`ReasoningAgent`], [`SemanticSearch`]

mod collab;
mod config;
mod error;
mod types;

pub use collab::{ReasoningAgent, SemanticSearch, SourceControl};
pub use config::{
    AgentConfig, CacheConfig, ContextConfig, ExecutionMode, QueueConfig, ResilienceConfig,
    RunnerConfig, SearchConfig, VigilConfig,
};
pub use error::VigilError;
pub use types::{
    AgentRequest, ChangedFile, ContextStrategy, FileContext, FileStatus, Finding, RelatedFile,
    Relationship, SearchHealth, SearchHit, Severity, SymbolTable,
};

/// A convenience `Result` type for Vigil operations.
pub type Result<T> = std::result::Result<T, VigilError>;
