//! Static checks run over the whole snippet before anything executes.

use std::fmt;
use std::sync::OnceLock;

use pyo3::prelude::*;
use pyo3::types::PyString;
use regex::Regex;

/// Refused even when a caller lists them as allowed.
pub const DANGEROUS_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "pathlib",
    "io",
    "socket",
    "pickle",
    "shelve",
    "dbm",
    "sqlite3",
    "pdb",
    "pty",
    "platform",
    "ctypes",
    "multiprocessing",
    "threading",
    "asyncio",
    "concurrent",
    "__main__",
    "__builtin__",
    "builtins",
    "posix",
    "importlib",
    "inspect",
    "gc",
    "signal",
];

/// Format strings that reach for a dunder through a replacement field.
fn dunder_field() -> &'static Regex {
    static FIELD: OnceLock<Regex> = OnceLock::new();
    FIELD.get_or_init(|| Regex::new(r"\{[^{}]*__\w*__").unwrap())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SafetyReport {
    pub issues: Vec<String>,
}

impl SafetyReport {
    pub fn is_safe(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for SafetyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_safe() {
            return write!(f, "The code is safe !");
        }
        write!(f, "Unsafe code detected")?;
        for issue in &self.issues {
            write!(f, "\n- {issue}")?;
        }
        Ok(())
    }
}

pub(crate) fn module_permitted(root: &str, allowed: &[String]) -> bool {
    !DANGEROUS_MODULES.contains(&root) && allowed.iter().any(|m| m == root)
}

/// Walk a parsed `ast.Module` and collect every refused construct, in
/// source order.
pub(crate) fn check(tree: &Bound<'_, PyAny>, allowed: &[String]) -> PyResult<SafetyReport> {
    let py = tree.py();
    let walked = py.import("ast")?.call_method1("walk", (tree,))?;
    let mut found: Vec<((usize, usize), String)> = Vec::new();
    for node in walked.try_iter()? {
        let node = node?;
        let position = (
            attr_usize(&node, "lineno"),
            attr_usize(&node, "col_offset"),
        );
        let mut push = |issue: String| found.push((position, issue));
        match kind_of(&node)?.as_str() {
            "Import" => {
                for alias in node.getattr("names")?.try_iter()? {
                    let name: String = alias?.getattr("name")?.extract()?;
                    if let Some(issue) = module_issue(&name, allowed) {
                        push(issue);
                    }
                }
            }
            "ImportFrom" => {
                let level: usize = node.getattr("level")?.extract().unwrap_or(0);
                let module: Option<String> = node.getattr("module")?.extract()?;
                if level > 0 {
                    push("Relative imports are not authorized".into());
                } else if let Some(issue) = module.and_then(|m| module_issue(&m, allowed)) {
                    push(issue);
                }
            }
            "Attribute" => {
                let attr: String = node.getattr("attr")?.extract()?;
                if is_dunder(&attr) {
                    push(format!("Access to the attribute {attr} is not authorized"));
                }
            }
            "Name" => {
                let id: String = node.getattr("id")?.extract()?;
                if is_dunder(&id) {
                    push(format!("Access to {id} is not authorized"));
                }
            }
            "Constant" => {
                let value = node.getattr("value")?;
                if let Ok(text) = value.downcast::<PyString>() {
                    if dunder_field().is_match(&text.to_cow()?) {
                        push("Format fields reaching dunder attributes are not authorized".into());
                    }
                }
            }
            _ => {}
        }
    }
    // `ast.walk` is breadth first; report in the order a reader meets them.
    found.sort_by_key(|(position, _)| *position);
    Ok(SafetyReport {
        issues: found.into_iter().map(|(_, issue)| issue).collect(),
    })
}

/// Top-level expression statements that call something other than `print`.
pub(crate) fn is_orphan_call(stmt: &Bound<'_, PyAny>) -> PyResult<bool> {
    if kind_of(stmt)? != "Expr" {
        return Ok(false);
    }
    let value = stmt.getattr("value")?;
    if kind_of(&value)? != "Call" {
        return Ok(false);
    }
    let func = value.getattr("func")?;
    if kind_of(&func)? == "Name" {
        let id: String = func.getattr("id")?.extract()?;
        return Ok(id != "print");
    }
    Ok(true)
}

pub(crate) fn kind_of(node: &Bound<'_, PyAny>) -> PyResult<String> {
    node.get_type().name()?.extract()
}

fn attr_usize(node: &Bound<'_, PyAny>, name: &str) -> usize {
    node.getattr(name)
        .and_then(|v| v.extract())
        .unwrap_or(0)
}

fn module_issue(name: &str, allowed: &[String]) -> Option<String> {
    let root = name.split('.').next().unwrap_or(name);
    if DANGEROUS_MODULES.contains(&root) {
        Some(format!("The module {root} is dangerous"))
    } else if !allowed.iter().any(|m| m == root) {
        Some(format!("The module {root} is not authorized"))
    } else {
        None
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["math".into(), "json".into()]
    }

    fn report(code: &str, allowed: &[String]) -> SafetyReport {
        Python::with_gil(|py| {
            let tree = py
                .import("ast")
                .and_then(|ast| ast.call_method1("parse", (code,)))
                .unwrap();
            check(&tree, allowed).unwrap()
        })
    }

    #[test]
    fn test_allowed_import_is_safe() {
        assert!(report("import math\nfrom json import dumps\n", &allowed()).is_safe());
    }

    #[test]
    fn test_dangerous_and_unlisted_modules() {
        let report = report("import os.path\nimport random\n", &allowed());
        assert_eq!(
            report.issues,
            vec![
                "The module os is dangerous".to_string(),
                "The module random is not authorized".to_string(),
            ]
        );
        assert_eq!(
            report.to_string(),
            "Unsafe code detected\n- The module os is dangerous\n- The module random is not authorized"
        );
    }

    #[test]
    fn test_dangerous_module_refused_even_when_listed() {
        assert!(!report("import subprocess\n", &["subprocess".to_string()]).is_safe());
        assert!(!module_permitted("subprocess", &["subprocess".to_string()]));
        assert!(module_permitted("math", &allowed()));
    }

    #[test]
    fn test_nested_imports_and_dunders_are_found() {
        let src = "def f():\n    import socket\n    return x.__class__\n";
        let report = report(src, &allowed());
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[1].contains("__class__"));
    }

    #[test]
    fn test_relative_import_and_format_escape() {
        let report = report(
            "from . import secrets\ns = '{0.__class__}'.format(1)\n",
            &allowed(),
        );
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].starts_with("Relative imports"));
    }

    #[test]
    fn test_dunder_methods_may_be_defined() {
        let src = "class P:\n    def __init__(self, x):\n        self.x = x\n";
        assert!(report(src, &allowed()).is_safe());
    }

    #[test]
    fn test_orphan_detection() {
        let orphans: Vec<bool> = Python::with_gil(|py| {
            let tree = py
                .import("ast")
                .and_then(|ast| ast.call_method1("parse", ("print(1)\nmath.sqrt(4)\nx = f()\nf()\n",)))
                .unwrap();
            tree.getattr("body")
                .unwrap()
                .try_iter()
                .unwrap()
                .map(|stmt| is_orphan_call(&stmt.unwrap()).unwrap())
                .collect()
        });
        assert_eq!(orphans, vec![false, true, false, true]);
    }
}
