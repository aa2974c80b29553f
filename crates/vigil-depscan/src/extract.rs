use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use vigil_core::SymbolTable;

use crate::walker::{Language, SourceFile, SyntaxFamily};

/// Lexical rules for one language.
///
/// Import patterns may capture `module` (a single specifier), `names` or
/// `list` (a comma-separated list of imported names) and `block` (a Go-style
/// parenthesized block of quoted paths). Export patterns capture `name` or
/// `names`.
struct Rules {
    imports: Vec<Regex>,
    exports: Vec<Regex>,
}

impl Rules {
    fn new(imports: &[&str], exports: &[&str]) -> Self {
        let compile = |p: &&str| Regex::new(p).expect("invalid extraction pattern");
        Self {
            imports: imports.iter().map(compile).collect(),
            exports: exports.iter().map(compile).collect(),
        }
    }
}

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("invalid quoted-string pattern"));

static RULES: LazyLock<HashMap<Language, Rules>> = LazyLock::new(|| {
    let mut rules = HashMap::new();

    // Curly-brace family.
    let js = || {
        Rules::new(
            &[
                r#"(?m)^\s*import\s+(?:type\s+)?(?P<names>[^'";]*?)\s+from\s+['"](?P<module>[^'"]+)['"]"#,
                r#"(?m)^\s*import\s+['"](?P<module>[^'"]+)['"]"#,
                r#"(?m)^\s*export\s+(?:type\s+)?(?:\*|\*\s+as\s+\w+|\{[^}]*\})\s+from\s+['"](?P<module>[^'"]+)['"]"#,
                r#"\brequire\(\s*['"](?P<module>[^'"]+)['"]\s*\)"#,
                r#"\bimport\(\s*['"](?P<module>[^'"]+)['"]\s*\)"#,
            ],
            &[
                r"(?m)^\s*export\s+(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|interface|type|enum|namespace)\s+(?P<name>[A-Za-z_$][\w$]*)",
                r"(?m)^\s*export\s*\{(?P<names>[^}]*)\}",
                r"\bmodule\.exports\.(?P<name>[A-Za-z_$][\w$]*)\s*=",
                r"(?m)^\s*exports\.(?P<name>[A-Za-z_$][\w$]*)\s*=",
                r"\bmodule\.exports\s*=\s*\{(?P<names>[^}]*)\}",
            ],
        )
    };
    rules.insert(Language::JavaScript, js());
    rules.insert(Language::TypeScript, js());

    rules.insert(
        Language::Go,
        Rules::new(
            &[
                r#"(?m)^\s*import\s+(?:[\w.]+\s+)?"(?P<module>[^"]+)""#,
                r"(?ms)^\s*import\s*\((?P<block>.*?)\)",
            ],
            &[
                r"(?m)^func\s+(?:\([^)]*\)\s*)?(?P<name>[A-Z]\w*)",
                r"(?m)^(?:type|var|const)\s+(?P<name>[A-Z]\w*)",
            ],
        ),
    );

    rules.insert(
        Language::Rust,
        Rules::new(
            &[
                r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+(?P<module>[\w:]+?)::\{(?P<list>[^;]*)\}\s*;",
                r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+(?P<module>[\w:]+)(?:\s+as\s+\w+)?\s*;",
                r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(?P<module>\w+)\s*;",
                r"(?m)^\s*extern\s+crate\s+(?P<module>\w+)",
            ],
            &[
                r"(?m)^\s*pub(?:\([^)]*\))?\s+(?:async\s+)?(?:unsafe\s+)?(?:const\s+)?(?:fn|struct|enum|trait|type|const|static|mod|union)\s+(?P<name>\w+)",
                r"(?m)^\s*(?:#\[macro_export\]\s*)macro_rules!\s*(?P<name>\w+)",
            ],
        ),
    );

    let c_like = || {
        Rules::new(
            &[r#"(?m)^\s*#\s*(?:include|import)\s*[<"](?P<module>[^>"]+)[>"]"#],
            &[
                r"(?m)^(?:typedef\s+)?(?:class|struct|union|enum|namespace)\s+(?P<name>[A-Za-z_]\w*)",
                r"(?m)^#\s*define\s+(?P<name>[A-Za-z_]\w*)",
                r"(?m)^(?:static\s+|inline\s+|extern\s+|const\s+|unsigned\s+)*[A-Za-z_][\w:<>]*[\s\*&]+(?P<name>[A-Za-z_][\w:]*)\s*\(",
            ],
        )
    };
    rules.insert(Language::C, c_like());
    rules.insert(Language::Cpp, c_like());

    rules.insert(
        Language::Php,
        Rules::new(
            &[
                r"(?m)^\s*use\s+(?:function\s+|const\s+)?(?P<module>[\w\\]+)(?:\s+as\s+\w+)?\s*;",
                r#"\b(?:require|include)(?:_once)?\s*\(?\s*['"](?P<module>[^'"]+)['"]"#,
            ],
            &[
                r"(?m)^\s*(?:abstract\s+|final\s+|readonly\s+)*(?:class|interface|trait|enum)\s+(?P<name>\w+)",
                r"(?m)^function\s+(?P<name>\w+)",
            ],
        ),
    );

    // Attribute-style family.
    rules.insert(
        Language::Swift,
        Rules::new(
            &[
                r"(?m)^\s*(?:@testable\s+)?import\s+(?:(?:class|struct|enum|protocol|func|var|let|typealias)\s+)?(?P<module>[\w.]+)",
            ],
            &[
                r"(?m)^\s*(?:@\w+(?:\([^)]*\))?\s+)*(?:(?:public|open|internal|final)\s+)*(?:class|struct|enum|protocol|actor|func|typealias)\s+(?P<name>\w+)",
            ],
        ),
    );

    rules.insert(
        Language::ObjectiveC,
        Rules::new(
            &[
                r"(?m)^\s*@import\s+(?P<module>[\w.]+)\s*;",
                r#"(?m)^\s*#\s*(?:import|include)\s*[<"](?P<module>[^>"]+)[>"]"#,
            ],
            &[r"(?m)^\s*@(?:interface|protocol|implementation)\s+(?P<name>\w+)"],
        ),
    );

    // Indentation-style family.
    rules.insert(
        Language::Python,
        Rules::new(
            &[
                r"(?m)^\s*from\s+(?P<module>\.*[\w.]*)\s+import\s+(?:\((?P<list>[^)]*)\)|(?P<names>[^\n#]+))",
                r"(?m)^\s*import\s+(?P<names>[\w., ]+)",
            ],
            &[
                r"(?m)^(?:async\s+)?def\s+(?P<name>\w+)",
                r"(?m)^class\s+(?P<name>\w+)",
                r"(?m)^(?P<name>[A-Za-z_]\w*)\s*(?::[^=\n]*)?=[^=]",
            ],
        ),
    );

    rules.insert(
        Language::Ruby,
        Rules::new(
            &[
                r#"(?m)^\s*require(?:_relative)?\s*\(?\s*['"](?P<module>[^'"]+)['"]"#,
                r"(?m)^\s*(?:include|extend|prepend)\s+(?P<module>[A-Z][\w:]*)",
            ],
            &[
                r"(?m)^\s*(?:class|module)\s+(?P<name>[A-Z][\w:]*)",
                r"(?m)^\s*def\s+(?:self\.)?(?P<name>\w+[?!]?)",
            ],
        ),
    );

    // Namespace-style family.
    rules.insert(
        Language::Java,
        Rules::new(
            &[r"(?m)^\s*import\s+(?:static\s+)?(?P<module>[\w.]+(?:\.\*)?)\s*;"],
            &[
                r"(?m)^\s*(?:(?:public|protected|abstract|final|static|sealed|non-sealed)\s+)*(?:class|interface|enum|record|@interface)\s+(?P<name>\w+)",
            ],
        ),
    );

    rules.insert(
        Language::Kotlin,
        Rules::new(
            &[r"(?m)^\s*import\s+(?P<module>[\w.]+(?:\.\*)?)(?:\s+as\s+\w+)?"],
            &[
                r"(?m)^\s*(?:(?:public|internal|open|abstract|sealed|data|enum|inline|value|annotation|final|suspend)\s+)*(?:class|interface|object|fun|typealias)\s+(?:<[^>]*>\s*)?(?:[\w.]+\.)?(?P<name>\w+)",
            ],
        ),
    );

    rules.insert(
        Language::CSharp,
        Rules::new(
            &[
                r"(?m)^\s*(?:global\s+)?using\s+(?:static\s+)?(?:\w+\s*=\s*)?(?P<module>[\w.]+)\s*;",
            ],
            &[
                r"(?m)^\s*(?:(?:public|internal|protected|abstract|sealed|static|partial|readonly|record)\s+)*(?:class|interface|struct|enum|record)\s+(?P<name>\w+)",
            ],
        ),
    );

    rules
});

/// Words the C-family function pattern can mistake for a declared name.
const C_KEYWORDS: &[&str] = &["if", "while", "for", "switch", "return", "sizeof", "else"];

/// Extract the imports and exported names of a source text.
///
/// `language_hint` may be a language name (`"python"`), an extension
/// (`"ts"`, `".py"`) or a file path. Unknown languages yield an empty table.
/// Output is sorted and de-duplicated, so identical input always produces an
/// identical [`SymbolTable`].
///
/// # Examples
///
/// ```
/// use vigil_depscan::extract;
///
/// let table = extract("from billing.invoice import Invoice, total\n", "py");
/// assert!(table.imports.contains(&"billing.invoice".to_string()));
/// assert!(table.imports.contains(&"Invoice".to_string()));
///
/// let table = extract("export function formatPrice() {}\n", "typescript");
/// assert_eq!(table.exports, vec!["formatPrice".to_string()]);
/// ```
pub fn extract(source_text: &str, language_hint: &str) -> SymbolTable {
    extract_language(source_text, Language::from_hint(language_hint))
}

/// Extract symbols from a [`SourceFile`] using its detected language.
pub fn extract_file(file: &SourceFile) -> SymbolTable {
    extract_language(&file.content, file.language)
}

fn extract_language(source_text: &str, language: Language) -> SymbolTable {
    let Some(rules) = RULES.get(&language) else {
        return SymbolTable::default();
    };
    let stripped = strip_line_comments(source_text, language.family());
    let source_text = stripped.as_ref();

    let mut imports = BTreeSet::new();
    for pattern in &rules.imports {
        for caps in pattern.captures_iter(source_text) {
            if let Some(m) = caps.name("module") {
                let module = clean_module(m.as_str());
                if !module.is_empty() {
                    imports.insert(module);
                }
            }
            for group in ["names", "list"] {
                if let Some(m) = caps.name(group) {
                    imports.extend(split_names(m.as_str()).filter_map(import_name));
                }
            }
            if let Some(m) = caps.name("block") {
                imports.extend(
                    QUOTED
                        .captures_iter(m.as_str())
                        .map(|c| clean_module(&c[1]))
                        .filter(|s| !s.is_empty()),
                );
            }
        }
    }

    let mut exports = BTreeSet::new();
    for pattern in &rules.exports {
        for caps in pattern.captures_iter(source_text) {
            if let Some(m) = caps.name("name") {
                if let Some(name) = export_name(m.as_str()) {
                    exports.insert(name);
                }
            }
            if let Some(m) = caps.name("names") {
                exports.extend(split_names(m.as_str()).filter_map(export_name));
            }
        }
    }

    match language {
        Language::Python => exports.retain(|name| !name.starts_with('_')),
        Language::C | Language::Cpp => exports.retain(|name| !C_KEYWORDS.contains(&name.as_str())),
        _ => {}
    }

    SymbolTable {
        imports: imports.into_iter().collect(),
        exports: exports.into_iter().collect(),
    }
}

/// Blank out whole-line comments so commented-out imports are not reported.
///
/// Line count is preserved. Trailing comments after code are left alone.
fn strip_line_comments(source_text: &str, family: SyntaxFamily) -> Cow<'_, str> {
    let is_comment_start = |line: &str| match family {
        SyntaxFamily::Indentation => line.starts_with('#'),
        SyntaxFamily::CurlyBrace | SyntaxFamily::Attribute | SyntaxFamily::Namespace => {
            line.starts_with("//") || line.starts_with("/*")
        }
        SyntaxFamily::None => false,
    };
    if !source_text.lines().any(|l| is_comment_start(l.trim_start())) {
        return Cow::Borrowed(source_text);
    }

    let mut out = String::with_capacity(source_text.len());
    let mut in_block = false;
    for line in source_text.lines() {
        let trimmed = line.trim_start();
        if in_block {
            in_block = !trimmed.contains("*/");
        } else if trimmed.starts_with("/*") && family != SyntaxFamily::Indentation {
            in_block = !trimmed[2..].contains("*/");
        } else if !is_comment_start(trimmed) {
            out.push_str(line);
        }
        out.push('\n');
    }
    Cow::Owned(out)
}

fn clean_module(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '\'' || c == '"')
        .trim_end_matches(':')
        .to_string()
}

fn split_names(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c == '{' || c == '}' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `useState as us` imports `useState`; `* as fs` imports nothing by name.
fn import_name(item: &str) -> Option<String> {
    let item = item.trim_start_matches("type ").trim();
    if item.starts_with('*') {
        return None;
    }
    let name = item.split_whitespace().next()?.trim_matches(':');
    is_identifier(name).then(|| name.to_string())
}

/// `helper as publicName` exports `publicName`; `key: value` exports `key`.
fn export_name(item: &str) -> Option<String> {
    let item = item.trim_start_matches("type ").trim();
    let item = match item.rsplit_once(" as ") {
        Some((_, alias)) => alias,
        None => item,
    };
    let item = item.rsplit("::").next()?;
    let name = item.split(':').next()?.trim();
    is_identifier(name).then(|| name.to_string())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '?' || c == '!')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_is_deterministic() {
        let source = r#"
import { b, a } from './z';
import React from 'react';
export const one = 1;
export function two() {}
"#;
        let first = extract(source, "ts");
        let second = extract(source, "ts");
        assert_eq!(first, second);
        assert_eq!(first.imports, vec!["./z", "React", "a", "b", "react"]);
        assert_eq!(first.exports, vec!["one", "two"]);
    }

    #[test]
    fn commented_out_imports_are_ignored() {
        let source = r#"
// import { legacy } from './old';
/*
import { Draft } from './draft';
export const draft = 1;
*/
import { live } from './live';
export const current = 2; // export const note = 3;
"#;
        let table = extract(source, "ts");
        assert_eq!(table.imports, vec!["./live", "live"]);
        assert_eq!(table.exports, vec!["current"]);
    }

    #[test]
    fn commented_out_require_is_ignored() {
        let source = "// const old = require('old-lib');\nconst lib = require('new-lib');\n";
        assert_eq!(extract(source, "js").imports, vec!["new-lib"]);
    }

    #[test]
    fn swift_block_comment_hides_imports() {
        let source = "/*\nimport LegacyKit\n*/\nimport UIKit\n";
        assert_eq!(extract(source, "swift").imports, vec!["UIKit"]);
    }

    #[test]
    fn c_includes_are_not_treated_as_comments() {
        let table = extract("// #include \"old.h\"\n#include \"net.h\"\n", "c");
        assert_eq!(table.imports, vec!["net.h"]);
    }

    #[test]
    fn typescript_imports_and_exports() {
        let source = r#"
import type { Money } from "../types/money";
import * as path from 'path';
import './polyfills';
const legacy = require('legacy-lib');
export { formatPrice, helper as publicHelper };
export default class PriceFormatter {}
export * from './currency';
"#;
        let table = extract(source, "src/price.ts");
        for module in ["../types/money", "path", "./polyfills", "legacy-lib", "./currency"] {
            assert!(table.imports.contains(&module.to_string()), "missing {module}");
        }
        assert!(table.imports.contains(&"Money".to_string()));
        assert!(!table.imports.contains(&"as".to_string()));
        assert_eq!(
            table.exports,
            vec!["PriceFormatter", "formatPrice", "publicHelper"]
        );
    }

    #[test]
    fn commonjs_exports() {
        let source = "module.exports = { parse, render: renderPage };\nexports.version = '1';\n";
        let table = extract(source, "js");
        assert_eq!(table.exports, vec!["parse", "render", "version"]);
    }

    #[test]
    fn go_import_block_and_capitalized_exports() {
        let source = r#"
package billing

import (
    "fmt"
    log "github.com/acme/logging"
)

import "strings"

func Total(items []Item) int { return 0 }
func (i *Invoice) Render() string { return "" }
func helper() {}
type Invoice struct {}
"#;
        let table = extract(source, "go");
        assert_eq!(
            table.imports,
            vec!["fmt", "github.com/acme/logging", "strings"]
        );
        assert_eq!(table.exports, vec!["Invoice", "Render", "Total"]);
    }

    #[test]
    fn rust_use_and_pub_items() {
        let source = r#"
use std::collections::HashMap;
use crate::invoice::{Invoice, LineItem};
pub(crate) use crate::money::Money as Cash;
mod tax;

pub struct Ledger;
pub const fn zero() -> u32 { 0 }
pub const LIMIT: u32 = 10;
fn private() {}
"#;
        let table = extract(source, "rust");
        for import in [
            "std::collections::HashMap",
            "crate::invoice",
            "Invoice",
            "LineItem",
            "crate::money::Money",
            "tax",
        ] {
            assert!(table.imports.contains(&import.to_string()), "missing {import}");
        }
        assert_eq!(table.exports, vec!["LIMIT", "Ledger", "zero"]);
    }

    #[test]
    fn c_includes_and_definitions() {
        let source = "#include <stdio.h>\n#include \"ledger.h\"\n#define MAX_ITEMS 10\nstruct ledger {};\nint ledger_total(struct ledger *l) {\n    if (l) { return 0; }\n}\n";
        let table = extract(source, "c");
        assert_eq!(table.imports, vec!["ledger.h", "stdio.h"]);
        assert_eq!(table.exports, vec!["MAX_ITEMS", "ledger", "ledger_total"]);
    }

    #[test]
    fn swift_attribute_imports() {
        let source = r#"
import UIKit
@testable import PaymentsKit
import struct Foundation.Date

public final class CheckoutViewModel {}
private struct Hidden {}
"#;
        let table = extract(source, "swift");
        assert_eq!(table.imports, vec!["Foundation.Date", "PaymentsKit", "UIKit"]);
        assert_eq!(table.exports, vec!["CheckoutViewModel"]);
    }

    #[test]
    fn objective_c_module_imports() {
        let source = "@import Foundation;\n#import \"CartView.h\"\n@interface CartController : NSObject\n@end\n";
        let table = extract(source, "m");
        assert_eq!(table.imports, vec!["CartView.h", "Foundation"]);
        assert_eq!(table.exports, vec!["CartController"]);
    }

    #[test]
    fn python_from_import_and_private_filtering() {
        let source = r#"
import os, sys as system
from .models import (
    User,
    Account as Acct,
)
from billing.invoice import Invoice  # trailing comment

MAX_RETRIES = 3
_cache = {}

class InvoiceService:
    pass

def create_invoice(user):
    pass

def _internal():
    pass
"#;
        let table = extract(source, "python");
        for import in [".models", "User", "Account", "billing.invoice", "Invoice", "os", "sys"] {
            assert!(table.imports.contains(&import.to_string()), "missing {import}");
        }
        assert_eq!(
            table.exports,
            vec!["InvoiceService", "MAX_RETRIES", "create_invoice"]
        );
    }

    #[test]
    fn ruby_require_and_definitions() {
        let source = "require 'json'\nrequire_relative '../lib/invoice'\n\nmodule Billing\n  class Admin::Invoice < Base\n    include Payable\n    def total?\n    end\n  end\nend\n";
        let table = extract(source, "rb");
        assert_eq!(table.imports, vec!["../lib/invoice", "Payable", "json"]);
        assert_eq!(table.exports, vec!["Billing", "Invoice", "total?"]);
    }

    #[test]
    fn namespace_style_languages() {
        let java = "package com.acme.billing;\nimport com.acme.money.Money;\nimport static org.junit.Assert.*;\npublic final class InvoiceService {}\nprivate class Hidden {}\n";
        let table = extract(java, "java");
        assert_eq!(
            table.imports,
            vec!["com.acme.money.Money", "org.junit.Assert.*"]
        );
        assert_eq!(table.exports, vec!["InvoiceService"]);

        let kotlin = "import com.acme.money.Money as Cash\ndata class Invoice(val total: Int)\nfun String.toSlug(): String = this\n";
        let table = extract(kotlin, "kt");
        assert_eq!(table.imports, vec!["com.acme.money.Money"]);
        assert_eq!(table.exports, vec!["Invoice", "toSlug"]);

        let csharp = "using System;\nusing Acme.Billing.Models;\nnamespace Acme.Billing\n{\n    public sealed partial class InvoiceService {}\n    internal record struct Total;\n}\n";
        let table = extract(csharp, "cs");
        assert_eq!(table.imports, vec!["Acme.Billing.Models", "System"]);
        assert_eq!(table.exports, vec!["InvoiceService", "Total"]);
    }

    #[test]
    fn unknown_language_yields_empty_table() {
        assert_eq!(extract("anything at all", "cobol"), SymbolTable::default());
        assert_eq!(extract("", "rust"), SymbolTable::default());
    }

    #[test]
    fn extract_file_uses_detected_language() {
        let file = SourceFile::new("pkg/util.py", "def slugify(s):\n    return s\n");
        assert_eq!(extract_file(&file).exports, vec!["slugify"]);
    }
}
