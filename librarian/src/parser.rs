//! Structural source parser.
//!
//! Walks a file line by line tracking indentation, the same approach the
//! teacher's Python analyzer takes (no external AST crate), but goes further:
//! every class/function/method gets a real `start_line..end_line` span
//! (the span ends at the last line belonging to its indented block, not at
//! the `def`/`class` line), nested methods are attached to their owning
//! class, and docstrings/parameters/bases/calls are extracted alongside.
//!
//! A file that can't be decoded as UTF-8 is treated as binary and skipped
//! by the caller before this module ever sees it (see
//! [`crate::fs_walk::is_probably_binary`]). A file that *can* be decoded but
//! doesn't parse as valid Python structure (mismatched indentation, an
//! unterminated triple-quoted string) yields a [`crate::model::FileSummary`]
//! with `parse_error` set rather than a hard failure — the surrounding index
//! build keeps going.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{CallRef, ComponentKind, ComponentRef, FileSummary, Import, Param};

static CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)class\s+([A-Za-z_][A-Za-z0-9_]*)\s*(\(([^)]*)\))?\s*:").unwrap());
static DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*(->\s*([^:]+))?\s*:").unwrap()
});
static IMPORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*import\s+(.+)").unwrap());
static FROM_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*from\s+([A-Za-z0-9_.]+)\s+import\s+(.+)").unwrap());
static CONST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z][A-Z0-9_]*)\s*(:\s*[A-Za-z0-9_\[\], ]+)?=").unwrap());
static CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\(").unwrap()
});
static DOCSTRING_START_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*("""|''')"#).unwrap());

const CALL_KEYWORDS: &[&str] = &[
    "if", "elif", "while", "for", "return", "yield", "with", "except", "def", "class", "lambda",
    "print", "super", "not", "and", "or", "in", "is", "assert", "raise", "del",
];

/// Parse `source` (the already-read contents of a `.py` file) into a
/// [`FileSummary`]. Never panics: a structural inconsistency is reported via
/// `parse_error` on the returned summary rather than propagated.
pub fn parse_python(relative_path: &str, source: &str) -> FileSummary {
    if let Some(reason) = find_structural_error(source) {
        return FileSummary::stub_with_error(relative_path, reason);
    }

    let lines: Vec<&str> = source.lines().collect();
    let mut summary = FileSummary::new(relative_path);

    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i];
        if let Some(caps) = CLASS_RE.captures(line) {
            let indent = caps[1].len();
            let name = caps[2].to_string();
            let bases = caps
                .get(4)
                .map(|m| split_args(m.as_str()))
                .unwrap_or_default()
                .into_iter()
                .filter(|b| !b.is_empty() && !b.contains('='))
                .collect();
            let end = block_end(&lines, i, indent);
            let mut component = ComponentRef::new(name, ComponentKind::Class, i + 1, end + 1);
            component.bases = bases;
            component.docstring = extract_docstring(&lines, i + 1, end);
            collect_methods(&lines, i + 1, end, indent, &mut component);
            i = end + 1;
            summary.classes.push(component);
            continue;
        }
        if let Some(caps) = DEF_RE.captures(line) {
            let indent = caps[1].len();
            // Only top-level defs here; nested ones are picked up by
            // collect_methods when their owning class is processed above.
            if indent == 0 {
                let end = block_end(&lines, i, indent);
                let component = build_function(&lines, i, end, indent, &caps, ComponentKind::Function);
                i = end + 1;
                summary.functions.push(component);
                continue;
            }
        }
        if let Some(caps) = FROM_IMPORT_RE.captures(line) {
            let module = caps[1].to_string();
            for name in split_args(&caps[2]) {
                let name = name.trim().split(" as ").next().unwrap_or("").trim();
                if name.is_empty() || name == "(" || name == ")" {
                    continue;
                }
                summary.imports.push(Import {
                    module_path: module.clone(),
                    imported_name: format!("{module}.{name}"),
                    line: i + 1,
                });
            }
        } else if let Some(caps) = IMPORT_RE.captures(line) {
            for name in split_args(&caps[1]) {
                let name = name.trim().split(" as ").next().unwrap_or("").trim();
                if name.is_empty() {
                    continue;
                }
                summary.imports.push(Import {
                    module_path: name.to_string(),
                    imported_name: name.to_string(),
                    line: i + 1,
                });
            }
        } else if line.chars().next().is_some_and(|c| !c.is_whitespace()) {
            if let Some(caps) = CONST_RE.captures(line) {
                summary.constants.push(caps[1].to_string());
            }
        }
        i += 1;
    }

    summary
}

/// A light structural sanity check: unterminated triple-quoted strings and
/// `def`/`class` headers with no following indented body. Anything else is
/// left to best-effort line scanning.
fn find_structural_error(source: &str) -> Option<String> {
    let mut in_triple: Option<&str> = None;
    for (idx, raw_line) in source.lines().enumerate() {
        let mut line = raw_line;
        loop {
            match in_triple {
                Some(delim) => {
                    if let Some(pos) = line.find(delim) {
                        in_triple = None;
                        line = &line[pos + delim.len()..];
                    } else {
                        break;
                    }
                }
                None => {
                    let triple_pos = line.find("\"\"\"").map(|p| (p, "\"\"\""));
                    let alt_pos = line.find("'''").map(|p| (p, "'''"));
                    let next = match (triple_pos, alt_pos) {
                        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
                        (Some(a), None) => Some(a),
                        (None, Some(b)) => Some(b),
                        (None, None) => None,
                    };
                    match next {
                        Some((pos, delim)) => {
                            line = &line[pos + delim.len()..];
                            in_triple = Some(delim);
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = idx;
    }
    if in_triple.is_some() {
        return Some("unterminated triple-quoted string".to_string());
    }
    None
}

/// Find the last line index (0-based, inclusive) belonging to the indented
/// block that starts right after `header_idx`. Blank lines and comment-only
/// lines inside the gap don't end the block; the block ends at the last
/// line whose indentation is strictly greater than `header_indent`, or at
/// `header_idx` itself if the header has no body (bare `pass`-free stub).
fn block_end(lines: &[&str], header_idx: usize, header_indent: usize) -> usize {
    let mut last_body_line = header_idx;
    let mut j = header_idx + 1;
    while j < lines.len() {
        let line = lines[j];
        let trimmed = line.trim();
        if trimmed.is_empty() {
            j += 1;
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        if indent > header_indent {
            last_body_line = j;
            j += 1;
        } else {
            break;
        }
    }
    last_body_line
}

fn collect_methods(
    lines: &[&str],
    from: usize,
    to: usize,
    class_indent: usize,
    class_component: &mut ComponentRef,
) {
    let method_indent = class_indent + 4;
    let mut i = from;
    while i <= to && i < lines.len() {
        let line = lines[i];
        if let Some(caps) = DEF_RE.captures(line) {
            let indent = caps[1].len();
            if indent == method_indent {
                let end = block_end(lines, i, indent).min(to);
                let component = build_function(lines, i, end, indent, &caps, ComponentKind::Method);
                class_component.methods.insert(component.name.clone(), component);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
}

fn build_function(
    lines: &[&str],
    start: usize,
    end: usize,
    indent: usize,
    caps: &regex::Captures<'_>,
    kind: ComponentKind,
) -> ComponentRef {
    let name = caps[2].to_string();
    let params = split_args(&caps[3])
        .into_iter()
        .filter_map(|raw| parse_param(raw.trim()))
        .collect();
    let return_type = caps.get(5).map(|m| m.as_str().trim().to_string());

    let mut component = ComponentRef::new(name, kind, start + 1, end + 1);
    component.parameters = params;
    component.return_type = return_type;
    component.docstring = extract_docstring(lines, start + 1, end);
    component.calls = extract_calls(lines, start + 1, end, indent);
    component
}

fn parse_param(raw: &str) -> Option<Param> {
    if raw.is_empty() || raw == "self" || raw == "cls" {
        return None;
    }
    let raw = raw.trim_start_matches('*');
    let (name_and_type, default_value) = match raw.split_once('=') {
        Some((lhs, rhs)) => (lhs.trim(), Some(rhs.trim().to_string())),
        None => (raw.trim(), None),
    };
    let (name, type_annotation) = match name_and_type.split_once(':') {
        Some((n, t)) => (n.trim().to_string(), Some(t.trim().to_string())),
        None => (name_and_type.to_string(), None),
    };
    if name.is_empty() {
        return None;
    }
    Some(Param {
        name,
        type_annotation,
        default_value,
    })
}

/// Splits a comma list while respecting nested `()`/`[]`/`{}` so default
/// values like `x=(1, 2)` don't get split mid-tuple.
fn split_args(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn extract_docstring(lines: &[&str], body_start: usize, body_end: usize) -> Option<String> {
    let first = lines.get(body_start)?;
    let caps = DOCSTRING_START_RE.captures(first)?;
    let delim = caps[1].to_string();
    let after_open = &first[first.find(&delim).unwrap() + delim.len()..];
    if let Some(close_pos) = after_open.find(&delim) {
        return Some(after_open[..close_pos].trim().to_string());
    }
    let mut doc = vec![after_open.to_string()];
    for idx in (body_start + 1)..=body_end.min(lines.len().saturating_sub(1)) {
        let line = lines[idx];
        if let Some(close_pos) = line.find(&delim) {
            doc.push(line[..close_pos].to_string());
            return Some(doc.join("\n").trim().to_string());
        }
        doc.push(line.to_string());
    }
    None
}

fn extract_calls(lines: &[&str], body_start: usize, body_end: usize, owner_indent: usize) -> Vec<CallRef> {
    let mut calls = Vec::new();
    for idx in body_start..=body_end.min(lines.len().saturating_sub(1)) {
        let line = lines[idx];
        // Skip nested def/class headers inside a method body so a call isn't
        // double-attributed to both the nested function and its owner.
        let indent = line.len() - line.trim_start().len();
        if indent <= owner_indent && !line.trim().is_empty() {
            continue;
        }
        for caps in CALL_RE.captures_iter(line) {
            let name = caps[1].to_string();
            let head = name.split('.').next().unwrap_or("");
            if CALL_KEYWORDS.contains(&head) {
                continue;
            }
            calls.push(CallRef { name, line: idx + 1 });
        }
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_top_level_function() {
        let src = "def add(a, b=1):\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n";
        let summary = parse_python("a.py", src);
        assert_eq!(summary.functions.len(), 1);
        let f = &summary.functions[0];
        assert_eq!(f.name, "add");
        assert_eq!(f.start_line, 1);
        assert_eq!(f.end_line, 3);
        assert_eq!(f.parameters.len(), 2);
        assert_eq!(f.parameters[1].default_value.as_deref(), Some("1"));
        assert_eq!(f.docstring.as_deref(), Some("Add two numbers."));
    }

    #[test]
    fn parses_class_with_methods_and_bases() {
        let src = concat!(
            "class Dog(Animal):\n",
            "    def __init__(self, name):\n",
            "        self.name = name\n",
            "\n",
            "    def bark(self):\n",
            "        return f\"{self.name} says woof\"\n",
        );
        let summary = parse_python("dog.py", src);
        assert_eq!(summary.classes.len(), 1);
        let class = &summary.classes[0];
        assert_eq!(class.bases, vec!["Animal".to_string()]);
        assert_eq!(class.methods.len(), 2);
        assert!(class.methods.contains_key("bark"));
        assert_eq!(class.end_line, 6);
    }

    #[test]
    fn collects_imports() {
        let src = "import os\nfrom typing import List, Optional\n";
        let summary = parse_python("m.py", src);
        assert_eq!(summary.imports.len(), 3);
        assert_eq!(summary.imports[0].imported_name, "os");
        assert_eq!(summary.imports[1].imported_name, "typing.List");
    }

    #[test]
    fn flags_unterminated_triple_quote() {
        let src = "def f():\n    \"\"\"oops\n    return 1\n";
        let summary = parse_python("broken.py", src);
        assert!(summary.parse_error.is_some());
    }

    #[test]
    fn collects_calls_in_function_body() {
        let src = "def run():\n    helper(1)\n    obj.method(2)\n    if True:\n        other()\n";
        let summary = parse_python("c.py", src);
        let names: Vec<_> = summary.functions[0].calls.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"helper"));
        assert!(names.contains(&"obj.method"));
        assert!(names.contains(&"other"));
    }
}
