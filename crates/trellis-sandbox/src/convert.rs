//! Moving values between JSON and the Python objects snippets see.

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyString, PyTuple};
use serde_json::{Map, Number, Value as Json};

/// Containers nested deeper than this are reported by their repr.
const MAX_NESTING: usize = 64;

pub(crate) fn to_python(py: Python<'_>, value: &Json) -> PyResult<PyObject> {
    let object = match value {
        Json::Null => py.None(),
        Json::Bool(b) => b.into_pyobject(py)?.to_owned().into_any().unbind(),
        Json::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => i.into_pyobject(py)?.into_any().unbind(),
            (None, Some(u)) => u.into_pyobject(py)?.into_any().unbind(),
            _ => n
                .as_f64()
                .unwrap_or(f64::NAN)
                .into_pyobject(py)?
                .into_any()
                .unbind(),
        },
        Json::String(s) => PyString::new(py, s).into_any().unbind(),
        Json::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(to_python(py, item)?)?;
            }
            list.into_any().unbind()
        }
        Json::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, to_python(py, item)?)?;
            }
            dict.into_any().unbind()
        }
    };
    Ok(object)
}

/// JSON form of a snippet value. Anything without a JSON counterpart
/// (big ints, NaN, instances, cyclic containers) becomes its repr.
pub(crate) fn to_json(object: &Bound<'_, PyAny>) -> Json {
    convert(object, 0)
}

fn convert(object: &Bound<'_, PyAny>, depth: usize) -> Json {
    if object.is_none() {
        return Json::Null;
    }
    if depth > MAX_NESTING {
        return Json::String(repr(object));
    }
    if let Ok(b) = object.downcast::<PyBool>() {
        return Json::Bool(b.is_true());
    }
    if object.is_instance_of::<PyInt>() {
        if let Ok(i) = object.extract::<i64>() {
            return i.into();
        }
        if let Ok(u) = object.extract::<u64>() {
            return u.into();
        }
        return Json::String(repr(object));
    }
    if let Ok(f) = object.downcast::<PyFloat>() {
        return Number::from_f64(f.value())
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(repr(object)));
    }
    if let Ok(s) = object.downcast::<PyString>() {
        return Json::String(s.to_string());
    }
    if let Ok(dict) = object.downcast::<PyDict>() {
        let mut map = Map::new();
        for (key, item) in dict.iter() {
            let key = match key.downcast::<PyString>() {
                Ok(s) => s.to_string(),
                Err(_) => repr(&key),
            };
            map.insert(key, convert(&item, depth + 1));
        }
        return Json::Object(map);
    }
    if let Ok(list) = object.downcast::<PyList>() {
        return Json::Array(list.iter().map(|item| convert(&item, depth + 1)).collect());
    }
    if let Ok(tuple) = object.downcast::<PyTuple>() {
        return Json::Array(tuple.iter().map(|item| convert(&item, depth + 1)).collect());
    }
    if object.is_instance_of::<PySet>() || object.is_instance_of::<PyFrozenSet>() {
        if let Ok(items) = object.try_iter() {
            return Json::Array(
                items
                    .filter_map(Result::ok)
                    .map(|item| convert(&item, depth + 1))
                    .collect(),
            );
        }
    }
    Json::String(repr(object))
}

fn repr(object: &Bound<'_, PyAny>) -> String {
    object
        .repr()
        .map(|r| r.to_string())
        .unwrap_or_else(|_| "<unrepresentable>".into())
}

/// Render a JSON value the way Python's `str()` shows the matching object.
pub(crate) fn python_str(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => python_repr(other),
    }
}

/// Render a JSON value the way Python's `repr()` shows the matching object.
pub(crate) fn python_repr(value: &Json) -> String {
    match value {
        Json::Null => "None".into(),
        Json::Bool(true) => "True".into(),
        Json::Bool(false) => "False".into(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => quote(s),
        Json::Array(items) => {
            let items: Vec<String> = items.iter().map(python_repr).collect();
            format!("[{}]", items.join(", "))
        }
        Json::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote(k), python_repr(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

fn quote(s: &str) -> String {
    let delimiter = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delimiter);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}
