use std::path::{Path, PathBuf};

use vigil_core::VigilError;

/// Maximum file size to load into the universe (1 MB).
const MAX_FILE_SIZE: u64 = 1_048_576;

/// Number of bytes to check for binary detection.
const BINARY_CHECK_SIZE: usize = 8192;

/// A source file with its text, the unit the extractor works on.
///
/// # Examples
///
/// ```
/// use vigil_depscan::walker::{Language, SourceFile};
///
/// let file = SourceFile::new("src/main.rs", "fn main() {}");
/// assert_eq!(file.language, Language::Rust);
/// assert_eq!(file.path_str(), "src/main.rs");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// Detected programming language.
    pub language: Language,
    /// Full file content.
    pub content: String,
}

impl SourceFile {
    /// Build a source file, detecting the language from the path.
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        let language = Language::from_path(&path);
        Self {
            path,
            language,
            content: content.into(),
        }
    }

    /// Path as a forward-slash string, the form the source-control host uses.
    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

/// Programming language detected from file extension or a caller hint.
///
/// # Examples
///
/// ```
/// use vigil_depscan::walker::Language;
///
/// assert_eq!(Language::from_extension("rs"), Language::Rust);
/// assert_eq!(Language::from_extension("py"), Language::Python);
/// assert_eq!(Language::from_extension("cs"), Language::CSharp);
/// assert_eq!(Language::from_extension("txt"), Language::Unknown);
/// assert_eq!(Language::from_hint("TypeScript"), Language::TypeScript);
/// assert_eq!(Language::from_hint(".swift"), Language::Swift);
/// assert_eq!(Language::from_hint("lib/models/user.rb"), Language::Ruby);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    JavaScript,
    Go,
    Java,
    C,
    Cpp,
    Ruby,
    Php,
    Kotlin,
    Swift,
    ObjectiveC,
    CSharp,
    Unknown,
}

/// Lexical family a language's import syntax belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxFamily {
    /// `import x from 'y'`, `#include`, `use a::b;`, Go import blocks.
    CurlyBrace,
    /// `@import Foo;`, `@testable import Foo`.
    Attribute,
    /// `from x import y`, `require 'x'`.
    Indentation,
    /// `using A.B;`, `package a.b` with class declarations.
    Namespace,
    /// No rules; yields an empty symbol table.
    None,
}

impl Language {
    /// Detect language from a file extension string (without the dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" | "vue" | "svelte" => Language::JavaScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hxx" | "hh" => Language::Cpp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "kt" | "kts" => Language::Kotlin,
            "swift" => Language::Swift,
            "m" | "mm" => Language::ObjectiveC,
            "cs" => Language::CSharp,
            _ => Language::Unknown,
        }
    }

    /// Detect language from a path's extension.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Unknown)
    }

    /// Interpret a loose hint: a language name, an extension, or a file path.
    pub fn from_hint(hint: &str) -> Self {
        let hint = hint.trim();
        let lowered = hint.to_ascii_lowercase();
        let by_name = match lowered.as_str() {
            "rust" => Some(Language::Rust),
            "python" => Some(Language::Python),
            "typescript" => Some(Language::TypeScript),
            "javascript" | "node" => Some(Language::JavaScript),
            "go" | "golang" => Some(Language::Go),
            "java" => Some(Language::Java),
            "c" => Some(Language::C),
            "cpp" | "c++" => Some(Language::Cpp),
            "ruby" => Some(Language::Ruby),
            "php" => Some(Language::Php),
            "kotlin" => Some(Language::Kotlin),
            "swift" => Some(Language::Swift),
            "objc" | "objective-c" | "objectivec" => Some(Language::ObjectiveC),
            "csharp" | "c#" => Some(Language::CSharp),
            _ => None,
        };
        if let Some(language) = by_name {
            return language;
        }
        if let Some(ext) = lowered.strip_prefix('.') {
            return Language::from_extension(ext);
        }
        let by_ext = Language::from_extension(&lowered);
        if by_ext != Language::Unknown {
            return by_ext;
        }
        Language::from_path(Path::new(hint))
    }

    /// The lexical family used to pick extraction rules.
    pub fn family(self) -> SyntaxFamily {
        match self {
            Language::TypeScript
            | Language::JavaScript
            | Language::Go
            | Language::Rust
            | Language::C
            | Language::Cpp
            | Language::Php => SyntaxFamily::CurlyBrace,
            Language::Swift | Language::ObjectiveC => SyntaxFamily::Attribute,
            Language::Python | Language::Ruby => SyntaxFamily::Indentation,
            Language::Java | Language::Kotlin | Language::CSharp => SyntaxFamily::Namespace,
            Language::Unknown => SyntaxFamily::None,
        }
    }
}

/// Walk a repository, respecting `.gitignore`, returning source files.
///
/// Skips binary files, files larger than 1 MB, and files with unknown extensions.
/// Returned paths are relative to `root`.
///
/// # Errors
///
/// Returns [`VigilError::FileNotFound`] if `root` does not exist.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use vigil_depscan::walker::walk_repo;
///
/// let universe = walk_repo(Path::new(".")).unwrap();
/// for f in &universe {
///     println!("{}: {:?}", f.path.display(), f.language);
/// }
/// ```
pub fn walk_repo(root: &Path) -> Result<Vec<SourceFile>, VigilError> {
    if !root.exists() {
        return Err(VigilError::FileNotFound(root.to_path_buf()));
    }

    let walker = ignore::WalkBuilder::new(root).build();
    let mut files = Vec::new();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        let path = entry.path();

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.len() > MAX_FILE_SIZE {
            continue;
        }

        let language = Language::from_path(path);
        if language == Language::Unknown {
            continue;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => continue,
        };

        // Null bytes in the first 8KB mean binary.
        let check_len = content.len().min(BINARY_CHECK_SIZE);
        if content.as_bytes()[..check_len].contains(&0) {
            continue;
        }

        let relative = match path.strip_prefix(root) {
            Ok(r) => r.to_path_buf(),
            Err(_) => path.to_path_buf(),
        };

        files.push(SourceFile {
            path: relative,
            language,
            content,
        });
    }

    // Walk order depends on the filesystem; sort so the universe is stable.
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
