use vigil_core::FileContext;

/// Approximate token cost of one file context.
///
/// Counts a quarter token per byte of patch, full content, and related
/// excerpts. This is an estimate for batching, not real tokenization, and it
/// never decreases as content is attached.
///
/// # Examples
///
/// ```
/// use vigil_core::{ChangedFile, FileContext, FileStatus};
/// use vigil_context::budget::estimate_tokens;
///
/// let file = ChangedFile::new("a.rs", FileStatus::Modified, "x".repeat(400));
/// let diff_only = FileContext::diff_only(file.clone());
/// let full = FileContext::full_file(file, "y".repeat(800));
/// assert_eq!(estimate_tokens(&diff_only), 100);
/// assert_eq!(estimate_tokens(&full), 300);
/// ```
pub fn estimate_tokens(ctx: &FileContext) -> usize {
    let patch = ctx.file.patch.len() / 4;
    let content = ctx.full_content.as_deref().map_or(0, str::len) / 4;
    let related: usize = ctx.related_files.iter().map(|r| r.excerpt.len() / 4).sum();
    patch + content + related
}

/// Approximate token cost of a batch.
pub fn estimate_batch(contexts: &[FileContext]) -> usize {
    contexts.iter().map(estimate_tokens).sum()
}

/// Split contexts into batches that each fit within `max_tokens`.
///
/// Contexts keep their order. Batches are filled greedily; a context that is
/// larger than the ceiling on its own gets a batch to itself.
///
/// # Examples
///
/// ```
/// use vigil_core::{ChangedFile, FileContext, FileStatus};
/// use vigil_context::budget::batch_by_budget;
///
/// let ctx = |name: &str, bytes: usize| {
///     FileContext::diff_only(ChangedFile::new(name, FileStatus::Modified, "x".repeat(bytes)))
/// };
/// let batches = batch_by_budget(vec![ctx("a", 400), ctx("b", 400), ctx("c", 400)], 250);
/// assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
/// ```
pub fn batch_by_budget(contexts: Vec<FileContext>, max_tokens: usize) -> Vec<Vec<FileContext>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;

    for ctx in contexts {
        let cost = estimate_tokens(&ctx);
        if !current.is_empty() && used + cost > max_tokens {
            batches.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(ctx);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{ChangedFile, FileStatus, RelatedFile, Relationship};

    fn ctx(name: &str, patch_bytes: usize) -> FileContext {
        FileContext::diff_only(ChangedFile::new(
            name,
            FileStatus::Modified,
            "x".repeat(patch_bytes),
        ))
    }

    #[test]
    fn estimate_is_monotonic_as_context_grows() {
        let mut context = ctx("src/price.ts", 120);
        let diff_only = estimate_tokens(&context);

        context.full_content = Some("y".repeat(200));
        let with_content = estimate_tokens(&context);
        assert!(with_content >= diff_only);

        context.related_files.push(RelatedFile {
            path: "src/cart.ts".into(),
            relationship: Relationship::Dependent,
            excerpt: "z".repeat(80),
            score: None,
        });
        let with_related = estimate_tokens(&context);
        assert!(with_related >= with_content);
        assert_eq!(with_related, 30 + 50 + 20);
    }

    #[test]
    fn batch_estimate_sums_files() {
        let contexts = vec![ctx("a", 40), ctx("b", 80)];
        assert_eq!(estimate_batch(&contexts), 30);
        assert_eq!(estimate_batch(&[]), 0);
    }

    #[test]
    fn batches_respect_ceiling_and_order() {
        // 25 tokens each; 4 fit under 100.
        let contexts: Vec<FileContext> = (0..6).map(|i| ctx(&format!("f{i}"), 100)).collect();
        let batches = batch_by_budget(contexts, 100);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 4);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[1][0].file.path, "f4");
        for batch in &batches {
            assert!(estimate_batch(batch) <= 100);
        }
    }

    #[test]
    fn oversized_file_gets_own_batch() {
        let contexts = vec![ctx("small", 40), ctx("huge", 4000), ctx("tail", 40)];
        let batches = batch_by_budget(contexts, 100);
        let names: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|c| c.file.path.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["small"], vec!["huge"], vec!["tail"]]);
    }

    #[test]
    fn empty_input_has_no_batches() {
        assert!(batch_by_budget(Vec::new(), 100).is_empty());
    }
}
