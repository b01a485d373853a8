//! Restricted execution of model-generated Python snippets on an embedded
//! CPython interpreter.
//!
//! A snippet is parsed, checked statically, then run statement by statement
//! in a curated namespace. Failures never escape as Rust errors: they are
//! reported in [`SandboxResult::stderr`] and execution moves on.

mod convert;
pub mod extract;
mod limits;
mod namespace;
pub mod safety;

use std::sync::Arc;

use pyo3::exceptions::PyMemoryError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};
use trellis_core::config::SandboxConfig;
use trellis_core::Tool;

use crate::convert::{python_str, to_json};
use crate::limits::{AllocationLimit, Budget, ALLOCATION_REFUSED};
use crate::namespace::Namespace;
use crate::safety::{is_orphan_call, kind_of};

pub use extract::{extract_code, strip_simulated_output};
pub use namespace::FORBIDDEN_BUILTINS;
pub use safety::{SafetyReport, DANGEROUS_MODULES};

/// Outcome of one snippet execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// Plain data variables left in the snippet namespace, in assignment order.
    pub variables: Map<String, Json>,
    pub stdout: String,
    pub stderr: String,
}

impl SandboxResult {
    fn failed(stderr: String) -> Self {
        Self {
            stderr,
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.stderr.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Render the result as a message a model can read back.
    pub fn format(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        if !self.variables.is_empty() && self.stdout.is_empty() {
            let lines: Vec<String> = self
                .variables
                .iter()
                .map(|(k, v)| format!("- {k} : {}", python_str(v)))
                .collect();
            out.push_str("Variables :\n");
            out.push_str(&lines.join("\n"));
            out.push_str("\n\n");
        }
        if !self.stdout.is_empty() {
            out.push_str(&format!("Stdout :\n```bash\n{}\n```", self.stdout));
            if !self.stderr.is_empty() {
                out.push_str("\n\n");
            }
        }
        if !self.stderr.is_empty() {
            out.push_str(&format!("Stderr :\n```bash\n{}\n```", self.stderr));
        }
        out
    }
}

/// Executes snippets against a fixed set of tools and caller globals.
#[derive(Clone)]
pub struct CodeSandbox {
    config: SandboxConfig,
    tools: Vec<Arc<dyn Tool>>,
    tool_kwargs: Map<String, Json>,
    globals: Map<String, Json>,
}

impl CodeSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            tool_kwargs: Map::new(),
            globals: Map::new(),
        }
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Keyword arguments pre-bound to every tool call.
    pub fn with_tool_kwargs(mut self, kwargs: Map<String, Json>) -> Self {
        self.tool_kwargs = kwargs;
        self
    }

    /// Extra names visible to snippets. Names shadowing a forbidden
    /// builtin, and dunder names, are dropped.
    pub fn with_globals(mut self, globals: Map<String, Json>) -> Self {
        self.globals = globals
            .into_iter()
            .filter(|(k, _)| !FORBIDDEN_BUILTINS.contains(&k.as_str()) && !k.starts_with("__"))
            .collect();
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Parse and run the static checks without executing anything.
    pub fn check(&self, code: &str) -> Result<SafetyReport, String> {
        let code = dedent(code);
        Python::with_gil(|py| {
            let tree = parse(py, &code).map_err(|e| syntax_error(py, &e))?;
            safety::check(&tree, &self.config.allowed_modules).map_err(|e| e.to_string())
        })
    }

    pub fn execute(&self, code: &str) -> SandboxResult {
        let code = dedent(code);
        Python::with_gil(|py| match self.run(py, &code) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "sandbox could not be prepared");
                let (kind, message) = describe_error(py, &e);
                SandboxResult::failed(format!("{kind} : {message}\n"))
            }
        })
    }

    fn run(&self, py: Python<'_>, code: &str) -> PyResult<SandboxResult> {
        let tree = match parse(py, code) {
            Ok(tree) => tree,
            Err(e) => {
                debug!(error = %e, "snippet does not parse");
                return Ok(SandboxResult::failed(syntax_error(py, &e)));
            }
        };
        let report = safety::check(&tree, &self.config.allowed_modules)?;
        if !report.is_safe() {
            warn!(issues = ?report.issues, "refusing unsafe snippet");
            return Ok(SandboxResult::failed(report.to_string()));
        }

        let ns = Namespace::build(
            py,
            &self.config,
            &self.tools,
            &self.tool_kwargs,
            &self.globals,
        )?;
        let lines: Vec<&str> = code.lines().collect();
        let mut stderr = String::new();
        for stmt in tree.getattr("body")?.try_iter()? {
            let stmt = stmt?;
            if kind_of(&stmt)? == "FunctionDef" {
                let name: String = stmt.getattr("name")?.extract()?;
                if self.tools.iter().any(|t| t.name() == name) {
                    debug!(tool = %name, "skipping redefinition of a bound tool");
                    continue;
                }
            }
            let source = source_of(py, code, &stmt)?;
            if let Err(e) = self.run_block(py, &ns, &stmt, &source) {
                let (kind, message) = describe_error(py, &e);
                debug!(kind = %kind, "snippet statement failed");
                stderr.push_str(&format!("{kind} : {message}\n"));
                if self.config.add_traceback {
                    stderr.push_str(&traceback(py, &e, &lines));
                }
            }
        }

        Ok(SandboxResult {
            variables: self.variables(py, &ns.globals)?,
            stdout: ns.take_stdout()?.trim().to_string(),
            stderr,
        })
    }

    fn run_block(
        &self,
        py: Python<'_>,
        ns: &Namespace<'_>,
        stmt: &Bound<'_, PyAny>,
        source: &str,
    ) -> PyResult<()> {
        let ast = py.import("ast")?;
        let builtins = py.import("builtins")?;
        let orphan = is_orphan_call(stmt)?;
        let compiled = if orphan {
            let expression = ast.getattr("Expression")?.call1((stmt.getattr("value")?,))?;
            builtins
                .getattr("compile")?
                .call1((expression, "<string>", "eval"))?
        } else {
            let module = ast
                .getattr("Module")?
                .call1((vec![stmt.clone()], PyList::empty(py)))?;
            builtins
                .getattr("compile")?
                .call1((module, "<string>", "exec"))?
        };
        if !orphan && echoes_source(source) {
            ns.write(&format!("{source} # "))?;
        }

        let _allocations = AllocationLimit::enter(py, self.config.max_alloc_bytes);
        let budget = Budget::enter(py, self.config.max_steps, self.config.max_depth);
        let outcome = if orphan {
            builtins
                .getattr("eval")?
                .call1((compiled, &ns.globals))
                .and_then(|value| {
                    if value.is_none() {
                        return Ok(());
                    }
                    ns.write(&format!("{source} → {}\n", value.str()?))
                })
        } else {
            builtins
                .getattr("exec")?
                .call1((compiled, &ns.globals))
                .map(drop)
        };
        if let Some(kind) = budget.exhausted() {
            debug!(?kind, steps = budget.steps(), "statement ran out of budget");
        }
        outcome
    }

    /// Plain data left in the namespace. Seeded globals are reported only
    /// when the snippet changed them.
    fn variables(&self, py: Python<'_>, globals: &Bound<'_, PyDict>) -> PyResult<Map<String, Json>> {
        let module_type = py.import("types")?.getattr("ModuleType")?;
        let mut variables = Map::new();
        for (name, value) in globals.iter() {
            let Ok(name) = name.extract::<String>() else {
                continue;
            };
            if name.starts_with('_')
                || value.is_none()
                || value.is_callable()
                || value.is_instance(&module_type)?
            {
                continue;
            }
            let value = to_json(&value);
            if self.globals.get(&name) == Some(&value) {
                continue;
            }
            variables.insert(name, value);
        }
        Ok(variables)
    }
}

fn parse<'py>(py: Python<'py>, code: &str) -> PyResult<Bound<'py, PyAny>> {
    py.import("ast")?
        .call_method1("parse", (code, "<string>", "exec"))
}

fn source_of(py: Python<'_>, code: &str, stmt: &Bound<'_, PyAny>) -> PyResult<String> {
    let ast = py.import("ast")?;
    let segment = ast.call_method1("get_source_segment", (code, stmt))?;
    let source: String = if segment.is_none() {
        ast.call_method1("unparse", (stmt,))?.extract()?
    } else {
        segment.extract()?
    };
    Ok(source.trim().to_string())
}

/// Top-level prints are echoed before their output, unless they print an
/// f-string, whose source is rarely more useful than the text itself.
fn echoes_source(source: &str) -> bool {
    match source.strip_prefix("print(") {
        Some(rest) => !(rest.starts_with("f\"") || rest.starts_with("f'")),
        None => false,
    }
}

fn describe_error(py: Python<'_>, err: &PyErr) -> (String, String) {
    let kind = err
        .get_type(py)
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "Exception".into());
    let mut message = err
        .value(py)
        .str()
        .map(|s| s.to_string())
        .unwrap_or_default();
    if message.is_empty() && err.is_instance_of::<PyMemoryError>(py) {
        message = ALLOCATION_REFUSED.into();
    }
    (kind, message)
}

fn syntax_error(py: Python<'_>, err: &PyErr) -> String {
    let (kind, fallback) = describe_error(py, err);
    let value = err.value(py);
    let message: String = value
        .getattr("msg")
        .and_then(|m| m.extract())
        .unwrap_or(fallback);
    let line: Option<usize> = value
        .getattr("lineno")
        .and_then(|l| l.extract())
        .unwrap_or(None);
    match line {
        Some(line) => format!("{kind}: {message} (line {line})"),
        None => format!("{kind}: {message}"),
    }
}

/// Frames of the snippet itself, innermost last.
fn traceback(py: Python<'_>, err: &PyErr, lines: &[&str]) -> String {
    let mut out = String::new();
    let mut entry = err.traceback(py).map(Bound::into_any);
    while let Some(tb) = entry.take().filter(|tb| !tb.is_none()) {
        let code = tb.getattr("tb_frame").and_then(|f| f.getattr("f_code"));
        let lineno = tb.getattr("tb_lineno").and_then(|l| l.extract::<usize>());
        let (Ok(code), Ok(lineno)) = (code, lineno) else {
            break;
        };
        let filename: String = code
            .getattr("co_filename")
            .and_then(|f| f.extract())
            .unwrap_or_default();
        if filename == "<string>" {
            let name: String = code
                .getattr("co_name")
                .and_then(|n| n.extract())
                .unwrap_or_default();
            let line = lines
                .get(lineno.saturating_sub(1))
                .map(|l| l.trim())
                .unwrap_or_default();
            out.push_str(&format!(
                "  File \"<string>\", line {lineno}, in {name}\n    {line}\n"
            ));
        }
        entry = tb.getattr("tb_next").ok();
    }
    out
}

/// Remove the indentation shared by every non-blank line. Only ASCII
/// spaces and tabs count as indentation.
fn dedent(code: &str) -> String {
    let indent_of = |line: &str| line.len() - line.trim_start_matches(|c| c == ' ' || c == '\t').len();
    let indent = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(indent_of)
        .min()
        .unwrap_or(0);
    if indent == 0 {
        return code.to_string();
    }
    code.lines()
        .map(|l| {
            if l.trim().is_empty() {
                ""
            } else {
                l.get(indent..).unwrap_or(l)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Lookup {
        params: Vec<String>,
    }

    impl Tool for Lookup {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "Return the call arguments."
        }
        fn parameters(&self) -> &[String] {
            &self.params
        }
        fn invoke(&self, args: Vec<Json>, kwargs: Map<String, Json>) -> trellis_core::Result<Json> {
            Ok(json!({"args": args, "kwargs": kwargs}))
        }
    }

    struct Offline;

    impl Tool for Offline {
        fn name(&self) -> &str {
            "fetch"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        fn parameters(&self) -> &[String] {
            &[]
        }
        fn invoke(&self, _: Vec<Json>, _: Map<String, Json>) -> trellis_core::Result<Json> {
            Err(trellis_core::TrellisError::Task("service offline".into()))
        }
    }

    fn sandbox() -> CodeSandbox {
        CodeSandbox::new(SandboxConfig::default())
    }

    #[test]
    fn test_variables_and_stdout() {
        let result = sandbox().execute("x = 2\ny = x * 21\nprint(f'{y}')\n");
        assert_eq!(result.variables, *json!({"x": 2, "y": 42}).as_object().unwrap());
        assert_eq!(result.stdout, "42");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_syntax_error_returns_immediately() {
        let result = sandbox().execute("x = 1\nif x\n    y = 2\n");
        assert!(result.variables.is_empty());
        assert!(result.stderr.starts_with("SyntaxError"));
        assert!(result.stderr.ends_with("(line 2)"));
    }

    #[test]
    fn test_unsafe_import_runs_nothing() {
        let result = sandbox().execute("print('before')\nimport os\n");
        assert!(result.stdout.is_empty());
        assert_eq!(
            result.stderr,
            "Unsafe code detected\n- The module os is dangerous"
        );
    }

    #[test]
    fn test_orphan_call_is_reported() {
        let code = "def compute(a, b):\n    return a * b\ncompute(2, 3)\nprint(f'done')\n";
        let result = sandbox().execute(code);
        assert_eq!(result.stdout, "compute(2, 3) → 6\ndone");
    }

    #[test]
    fn test_print_echoes_its_source() {
        let result = sandbox().execute("x = 5\nprint(x + 1)\n");
        assert_eq!(result.stdout, "print(x + 1) # 6");
    }

    #[test]
    fn test_failing_statement_does_not_stop_execution() {
        let result = sandbox().execute("a = 1 / 0\nb = [1][3]\nc = 'ok'\n");
        assert_eq!(
            result.stderr,
            "ZeroDivisionError : division by zero\nIndexError : list index out of range\n"
        );
        assert_eq!(result.variables.get("c"), Some(&json!("ok")));
    }

    #[test]
    fn test_traceback_names_the_line() {
        let mut config = SandboxConfig::default();
        config.add_traceback = true;
        let result = CodeSandbox::new(config).execute("x = 1\ny = missing\n");
        assert_eq!(
            result.stderr,
            "NameError : name 'missing' is not defined\n  File \"<string>\", line 2, in <module>\n    y = missing\n"
        );
    }

    #[test]
    fn test_runaway_loop_hits_step_budget() {
        let mut config = SandboxConfig::default();
        config.max_steps = 10_000;
        let result = CodeSandbox::new(config).execute("while True:\n    pass\nz = 1\n");
        assert!(result.stderr.starts_with("TimeoutError"));
        assert_eq!(result.variables.get("z"), Some(&json!(1)));
    }

    #[test]
    fn test_step_budget_cannot_be_caught() {
        let mut config = SandboxConfig::default();
        config.max_steps = 10_000;
        let code = "try:\n    while True:\n        pass\nexcept Exception:\n    caught = True\nafter = 1\n";
        let result = CodeSandbox::new(config).execute(code);
        assert_eq!(
            result.stderr,
            "TimeoutError : execution step budget exhausted\n"
        );
        assert!(!result.variables.contains_key("caught"));
        assert_eq!(result.variables.get("after"), Some(&json!(1)));
    }

    #[test]
    fn test_deep_recursion_hits_depth_limit() {
        let mut config = SandboxConfig::default();
        config.max_depth = 32;
        let code = "def down(n):\n    return down(n + 1)\nr = down(0)\nok = True\n";
        let result = CodeSandbox::new(config).execute(code);
        assert_eq!(result.stderr, "RecursionError : maximum call depth exceeded\n");
        assert_eq!(result.variables.get("ok"), Some(&json!(true)));
    }

    #[test]
    fn test_width_driven_allocations_hit_the_cap() {
        let mut config = SandboxConfig::default();
        config.max_alloc_bytes = 1 << 20;
        let code = "a = len('x'.zfill(10 ** 8))\n\
                    b = len('y'.ljust(10 ** 8))\n\
                    c = len(f'{1:>100000000}')\n\
                    d = len('x' * 10 ** 8)\n\
                    e = len('x'.zfill(1000))\n";
        let result = CodeSandbox::new(config).execute(code);
        assert_eq!(
            result.stderr,
            "MemoryError : allocation exceeds the sandbox limit\n".repeat(4)
        );
        assert_eq!(result.variables.get("e"), Some(&json!(1000)));
        assert!(!result.variables.contains_key("a"));
    }

    #[test]
    fn test_tool_calls_merge_partial_kwargs() {
        let tool: Arc<dyn Tool> = Arc::new(Lookup {
            params: vec!["query".into(), "lang".into()],
        });
        let mut partial = Map::new();
        partial.insert("lang".into(), json!("fr"));
        partial.insert("query".into(), json!("default"));
        partial.insert("unrelated".into(), json!(true));
        let result = sandbox()
            .with_tools([tool])
            .with_tool_kwargs(partial)
            .execute("def lookup(query):\n    pass\nr = lookup('rust')\n");
        assert!(result.stderr.is_empty(), "{}", result.stderr);
        assert_eq!(
            result.variables.get("r"),
            Some(&json!({"args": ["rust"], "kwargs": {"lang": "fr"}}))
        );
    }

    #[test]
    fn test_failing_tool_raises_tool_error() {
        let tool: Arc<dyn Tool> = Arc::new(Offline);
        let code = "try:\n    fetch()\nexcept ToolError as e:\n    reason = str(e)\nfetch()\n";
        let result = sandbox().with_tools([tool]).execute(code);
        let reason = result.variables.get("reason").and_then(Json::as_str).unwrap_or_default();
        assert!(reason.contains("service offline"), "{reason}");
        assert!(result.stderr.starts_with("ToolError : "));
    }

    #[test]
    fn test_globals_are_visible_but_filtered() {
        let mut globals = Map::new();
        globals.insert("limit".into(), json!(3));
        globals.insert("eval".into(), json!("nope"));
        let result = sandbox()
            .with_globals(globals)
            .execute("n = limit + 1\ne = eval\n");
        assert_eq!(result.variables.get("n"), Some(&json!(4)));
        assert!(!result.variables.contains_key("limit"));
        assert!(result.stderr.starts_with("NameError"));
    }

    #[test]
    fn test_classes_and_preimported_modules() {
        let code = "class Point:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\n\
                    \n    def norm(self):\n        return abs(self.x) + abs(self.y)\n\
                    n = Point(3, -4).norm()\nroot = math.sqrt(16)\n";
        let result = sandbox().execute(code);
        assert!(result.stderr.is_empty(), "{}", result.stderr);
        assert_eq!(result.variables.get("n"), Some(&json!(7)));
        assert_eq!(result.variables.get("root"), Some(&json!(4.0)));
    }

    #[test]
    fn test_indented_snippet_is_dedented() {
        let result = sandbox().execute("    a = 1\n    b = a + 1\n");
        assert_eq!(result.variables.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_dedent_keeps_unicode_blank_lines() {
        assert_eq!(dedent("  x = 1\n\u{3000}\n  y = 2"), "x = 1\n\ny = 2");
        let result = sandbox().execute("  x = 1\n\u{3000}\n  y = 2");
        assert_eq!(result.variables.get("y"), Some(&json!(2)));
        assert!(result.stderr.is_empty(), "{}", result.stderr);
    }

    #[test]
    fn test_check_reports_without_running() {
        let report = sandbox().check("import socket\n").unwrap();
        assert_eq!(report.issues, vec!["The module socket is dangerous".to_string()]);
        assert!(sandbox().check("def f(:\n").is_err());
    }

    #[test]
    fn test_format_result() {
        let mut result = SandboxResult::default();
        assert_eq!(result.format(), "");
        result.variables.insert("x".into(), json!([1, "a"]));
        assert_eq!(result.format(), "Variables :\n- x : [1, 'a']\n\n");
        result.stdout = "hi".into();
        result.stderr = "ValueError : bad\n".into();
        assert_eq!(
            result.format(),
            "Stdout :\n```bash\nhi\n```\n\nStderr :\n```bash\nValueError : bad\n\n```"
        );
    }
}
