//! The globals a snippet runs against: curated builtins, caller values,
//! pre-imported modules and bound tools.

use std::sync::Arc;

use pyo3::create_exception;
use pyo3::exceptions::{PyBaseException, PyException, PyImportError};
use pyo3::ffi::c_str;
use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyTuple, PyType};
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};
use trellis_core::config::SandboxConfig;
use trellis_core::Tool;

use crate::convert::{to_json, to_python};
use crate::safety::{module_permitted, DANGEROUS_MODULES};

create_exception!(
    trellis_sandbox,
    ToolError,
    PyException,
    "Raised inside a snippet when a bound tool fails."
);

/// Builtins a snippet may use. Every exception type is added on top.
const SAFE_BUILTINS: &[&str] = &[
    "abs",
    "all",
    "any",
    "ascii",
    "bin",
    "bool",
    "bytearray",
    "bytes",
    "callable",
    "chr",
    "classmethod",
    "complex",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "hasattr",
    "hash",
    "hex",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "object",
    "oct",
    "ord",
    "pow",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "slice",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
    "NotImplemented",
    "Ellipsis",
    "__build_class__",
];

/// Names a caller may not shadow through seeded globals.
pub const FORBIDDEN_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "memoryview",
    "dir",
    "__import__",
    "help",
    "exit",
    "quit",
];

pub(crate) struct Namespace<'py> {
    pub(crate) globals: Bound<'py, PyDict>,
    stdout: Bound<'py, PyAny>,
}

impl<'py> Namespace<'py> {
    pub(crate) fn build(
        py: Python<'py>,
        config: &SandboxConfig,
        tools: &[Arc<dyn Tool>],
        tool_kwargs: &Map<String, Json>,
        seeded: &Map<String, Json>,
    ) -> PyResult<Self> {
        let stdout = py.import("io")?.call_method0("StringIO")?;
        let globals = PyDict::new(py);
        globals.set_item("__builtins__", builtins(py, config, &stdout)?)?;
        globals.set_item("__name__", "__sandbox__")?;

        for module in &config.allowed_modules {
            if DANGEROUS_MODULES.contains(&module.as_str()) {
                continue;
            }
            match py.import(module.as_str()) {
                Ok(imported) => globals.set_item(module, imported)?,
                Err(e) => warn!(module = %module, error = %e, "allowed module failed to import"),
            }
        }
        for (name, value) in seeded {
            globals.set_item(name, to_python(py, value)?)?;
        }
        for tool in tools {
            globals.set_item(tool.name(), bind_tool(py, Arc::clone(tool), tool_kwargs.clone())?)?;
        }
        Ok(Self { globals, stdout })
    }

    pub(crate) fn write(&self, text: &str) -> PyResult<()> {
        self.stdout.call_method1("write", (text,))?;
        Ok(())
    }

    pub(crate) fn take_stdout(&self) -> PyResult<String> {
        self.stdout.call_method0("getvalue")?.extract()
    }
}

fn builtins<'py>(
    py: Python<'py>,
    config: &SandboxConfig,
    stdout: &Bound<'py, PyAny>,
) -> PyResult<Bound<'py, PyDict>> {
    let real = py.import("builtins")?;
    let curated = PyDict::new(py);
    for name in SAFE_BUILTINS {
        match real.getattr(*name) {
            Ok(value) => curated.set_item(*name, value)?,
            Err(_) => debug!(builtin = %name, "builtin missing from this interpreter"),
        }
    }
    for (name, value) in real.dict().iter() {
        if let Ok(ty) = value.downcast::<PyType>() {
            if ty.is_subclass_of::<PyBaseException>()? {
                curated.set_item(name, value)?;
            }
        }
    }
    curated.set_item("ToolError", py.get_type::<ToolError>())?;

    let print = real.getattr("print")?.unbind();
    let sink = stdout.clone().unbind();
    let captured_print = PyCFunction::new_closure(
        py,
        Some(c_str!("print")),
        None,
        move |args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
            let py = args.py();
            let kwargs = match kwargs {
                Some(kwargs) => kwargs.copy()?,
                None => PyDict::new(py),
            };
            kwargs.set_item("file", sink.bind(py))?;
            print.bind(py).call(args.clone(), Some(&kwargs)).map(Bound::unbind)
        },
    )?;
    curated.set_item("print", captured_print)?;

    let import = real.getattr("__import__")?.unbind();
    let allowed = config.allowed_modules.clone();
    let guarded_import = PyCFunction::new_closure(
        py,
        Some(c_str!("__import__")),
        None,
        move |args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
            let name: String = args.get_item(0)?.extract()?;
            let level: i64 = match args.get_item(4) {
                Ok(level) => level.extract()?,
                Err(_) => match kwargs.map(|k| k.get_item("level")).transpose()?.flatten() {
                    Some(level) => level.extract()?,
                    None => 0,
                },
            };
            let root = name.split('.').next().unwrap_or(&name);
            if level != 0 || !module_permitted(root, &allowed) {
                return Err(PyImportError::new_err(format!(
                    "Import of {name} is not allowed"
                )));
            }
            import
                .bind(args.py())
                .call(args.clone(), kwargs)
                .map(Bound::unbind)
        },
    )?;
    curated.set_item("__import__", guarded_import)?;
    Ok(curated)
}

/// Expose `tool` as a callable. Pre-bound kwargs fill whatever the call
/// leaves out, then everything the tool does not declare is dropped.
fn bind_tool<'py>(
    py: Python<'py>,
    tool: Arc<dyn Tool>,
    partial: Map<String, Json>,
) -> PyResult<Bound<'py, PyCFunction>> {
    PyCFunction::new_closure(
        py,
        None,
        None,
        move |args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
            let py = args.py();
            let positional: Vec<Json> = args.iter().map(|arg| to_json(&arg)).collect();
            let mut explicit = Map::new();
            if let Some(kwargs) = kwargs {
                for (key, value) in kwargs.iter() {
                    explicit.insert(key.extract::<String>()?, to_json(&value));
                }
            }
            let merged = merge_kwargs(tool.as_ref(), &partial, positional.len(), explicit);
            debug!(tool = %tool.name(), args = positional.len(), "snippet calls tool");
            let callee = Arc::clone(&tool);
            match py.allow_threads(move || callee.invoke(positional, merged)) {
                Ok(value) => to_python(py, &value),
                Err(e) => Err(ToolError::new_err(e.to_string())),
            }
        },
    )
}

pub(crate) fn merge_kwargs(
    tool: &dyn Tool,
    partial: &Map<String, Json>,
    positional: usize,
    explicit: Map<String, Json>,
) -> Map<String, Json> {
    let params = tool.parameters();
    let mut merged = partial.clone();
    for filled in params.iter().take(positional) {
        merged.remove(filled);
    }
    merged.extend(explicit);
    if !tool.accepts_any() {
        merged.retain(|key, _| params.iter().any(|p| p == key));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Declared {
        params: Vec<String>,
        any: bool,
    }

    impl Tool for Declared {
        fn name(&self) -> &str {
            "declared"
        }
        fn description(&self) -> &str {
            ""
        }
        fn parameters(&self) -> &[String] {
            &self.params
        }
        fn accepts_any(&self) -> bool {
            self.any
        }
        fn invoke(&self, _: Vec<Json>, _: Map<String, Json>) -> trellis_core::Result<Json> {
            Ok(Json::Null)
        }
    }

    fn partial() -> Map<String, Json> {
        json!({"query": "default", "lang": "fr", "extra": 1})
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn test_merge_drops_positionally_filled_and_undeclared() {
        let tool = Declared {
            params: vec!["query".into(), "lang".into()],
            any: false,
        };
        let merged = merge_kwargs(&tool, &partial(), 1, Map::new());
        assert_eq!(Json::Object(merged), json!({"lang": "fr"}));
    }

    #[test]
    fn test_explicit_kwargs_win_and_open_tools_keep_extras() {
        let tool = Declared {
            params: vec!["query".into()],
            any: true,
        };
        let mut explicit = Map::new();
        explicit.insert("lang".into(), json!("de"));
        let merged = merge_kwargs(&tool, &partial(), 0, explicit);
        assert_eq!(
            Json::Object(merged),
            json!({"query": "default", "lang": "de", "extra": 1})
        );
    }

    #[test]
    fn test_builtins_are_curated() {
        Python::with_gil(|py| {
            let ns = Namespace::build(py, &SandboxConfig::default(), &[], &Map::new(), &Map::new())
                .unwrap();
            let builtins = ns.globals.get_item("__builtins__").unwrap().unwrap();
            let builtins = builtins.downcast::<PyDict>().unwrap();
            for name in FORBIDDEN_BUILTINS.iter().filter(|n| **n != "__import__") {
                assert!(!builtins.contains(*name).unwrap(), "{name} leaked");
            }
            assert!(builtins.contains("ValueError").unwrap());
            assert!(builtins.contains("ToolError").unwrap());
            assert!(ns.globals.contains("math").unwrap());
        });
    }
}
