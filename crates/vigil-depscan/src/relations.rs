use std::collections::BTreeSet;
use std::path::Path;

use vigil_core::SymbolTable;

use crate::extract::extract_file;
use crate::walker::SourceFile;

/// Stems that name their directory rather than themselves.
const DIRECTORY_STEMS: &[&str] = &["index", "mod", "__init__"];

/// Directory names that hold tests.
const TEST_DIRS: &[&str] = &["test", "tests", "__tests__", "spec", "specs"];

/// Symbol tables for a universe, extracted once and reused for every target.
///
/// Matching is lexical: a common stem such as `utils` produces false
/// positives, and re-exports under an alias are missed.
///
/// # Examples
///
/// ```
/// use vigil_depscan::{DependencyIndex, SourceFile};
///
/// let universe = vec![
///     SourceFile::new("src/cart.ts", "import { formatPrice } from './price';"),
///     SourceFile::new("src/price.ts", "export function formatPrice() {}"),
///     SourceFile::new("src/price.test.ts", "test('formats', () => {});"),
/// ];
/// let index = DependencyIndex::build(&universe);
///
/// let dependents = index.dependents_of(&universe[1]);
/// assert_eq!(dependents[0].path_str(), "src/cart.ts");
///
/// let tests = index.tests_of(&universe[1]);
/// assert_eq!(tests[0].path_str(), "src/price.test.ts");
/// ```
pub struct DependencyIndex<'a> {
    entries: Vec<(&'a SourceFile, SymbolTable)>,
}

impl<'a> DependencyIndex<'a> {
    /// Extract every file in `universe` once.
    pub fn build(universe: &'a [SourceFile]) -> Self {
        Self {
            entries: universe.iter().map(|f| (f, extract_file(f))).collect(),
        }
    }

    /// Number of indexed files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Files whose imports reference the target's stem or exported names.
    ///
    /// Results keep universe order and never include the target itself.
    pub fn dependents_of(&self, target: &SourceFile) -> Vec<&'a SourceFile> {
        let stem = module_stem(&target.path);
        let exports: BTreeSet<String> = extract_file(target).exports.into_iter().collect();

        self.entries
            .iter()
            .filter(|(candidate, _)| candidate.path != target.path)
            .filter(|(_, table)| {
                table
                    .imports
                    .iter()
                    .any(|import| import_references(import, &stem, &exports))
            })
            .map(|(candidate, _)| *candidate)
            .collect()
    }

    /// Files named as tests of the target, regardless of what they import.
    pub fn tests_of(&self, target: &SourceFile) -> Vec<&'a SourceFile> {
        let stem = file_stem(&target.path).to_lowercase();
        if stem.is_empty() {
            return Vec::new();
        }
        let markers = test_markers(&stem);

        self.entries
            .iter()
            .map(|(candidate, _)| *candidate)
            .filter(|candidate| candidate.path != target.path)
            .filter(|candidate| is_test_of(&candidate.path, &stem, &markers))
            .collect()
    }
}

/// Files in `universe` that import the target's stem or exported symbols.
///
/// # Examples
///
/// ```
/// use vigil_depscan::{find_dependents, SourceFile};
///
/// let universe = vec![
///     SourceFile::new("app/checkout.py", "from billing import Invoice\n"),
///     SourceFile::new("app/billing.py", "class Invoice:\n    pass\n"),
///     SourceFile::new("app/shipping.py", "import os\n"),
/// ];
/// let deps = find_dependents(&universe[1], &universe);
/// assert_eq!(deps.len(), 1);
/// assert_eq!(deps[0].path_str(), "app/checkout.py");
/// ```
pub fn find_dependents<'a>(target: &SourceFile, universe: &'a [SourceFile]) -> Vec<&'a SourceFile> {
    DependencyIndex::build(universe).dependents_of(target)
}

/// Files in `universe` whose name marks them as tests of the target.
pub fn find_related_tests<'a>(
    target: &SourceFile,
    universe: &'a [SourceFile],
) -> Vec<&'a SourceFile> {
    let index = DependencyIndex {
        entries: universe
            .iter()
            .map(|f| (f, SymbolTable::default()))
            .collect(),
    };
    index.tests_of(target)
}

/// The name other files use to import `path`.
///
/// `src/billing/index.ts` is imported as `billing`, so directory stems are
/// replaced with the parent directory name.
pub fn module_stem(path: &Path) -> String {
    let stem = file_stem(path);
    if DIRECTORY_STEMS.contains(&stem) {
        if let Some(parent) = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            return parent.to_string();
        }
    }
    stem.to_string()
}

fn file_stem(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("")
}

fn import_references(import: &str, stem: &str, exports: &BTreeSet<String>) -> bool {
    if stem.is_empty() && exports.is_empty() {
        return false;
    }

    // `./utils/format.js` names `format`; `../user.service` names `user.service`.
    let last = import.rsplit(['/', '\\']).next().unwrap_or(import);
    if !stem.is_empty() {
        let last = last.to_lowercase();
        let stem = stem.to_lowercase();
        if last == stem || last.starts_with(&format!("{stem}.")) {
            return true;
        }
    }

    import
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|seg| !seg.is_empty())
        .any(|seg| (!stem.is_empty() && seg.eq_ignore_ascii_case(stem)) || exports.contains(seg))
}

fn test_markers(stem: &str) -> [String; 9] {
    [
        format!("{stem}.test"),
        format!("{stem}.spec"),
        format!("{stem}_test"),
        format!("test_{stem}"),
        format!("{stem}test"),
        format!("{stem}tests"),
        format!("{stem}_spec"),
        format!("{stem}-test"),
        format!("{stem}spec"),
    ]
}

fn is_test_of(candidate: &Path, stem: &str, markers: &[String]) -> bool {
    let candidate_stem = file_stem(candidate).to_lowercase();
    if markers.iter().any(|m| *m == candidate_stem) {
        return true;
    }
    candidate_stem == stem
        && candidate
            .parent()
            .into_iter()
            .flat_map(|p| p.components())
            .filter_map(|c| c.as_os_str().to_str())
            .any(|dir| TEST_DIRS.contains(&dir.to_lowercase().as_str()))
}
