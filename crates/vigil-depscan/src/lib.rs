//! Lightweight dependency extraction for context selection.
//!
//! Recognizes import statements and top-level exported names with
//! per-language regular expressions (no full parsing), then relates files to
//! each other: which files depend on a changed file, and which files test it.
//! The `ignore` crate walks a local checkout to build the universe of known
//! files.

pub mod extract;
pub mod relations;
pub mod walker;

pub use extract::{extract, extract_file};
pub use relations::{find_dependents, find_related_tests, module_stem, DependencyIndex};
pub use walker::{walk_repo, Language, SourceFile, SyntaxFamily};
