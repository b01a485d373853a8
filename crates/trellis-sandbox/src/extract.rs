//! Helpers for pulling runnable code out of model answers.

use std::sync::OnceLock;

use regex::Regex;

fn fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new("```[a-z]*").unwrap())
}

/// Split `text` into its prose and the bodies of its fenced Python blocks.
///
/// Only bare fences and `python`/`py` fences count as code; any other fence
/// (and an unterminated one) stays in the prose untouched.
pub fn extract_code(text: &str) -> (String, Vec<String>) {
    let mut parts = Vec::new();
    let mut last = 0;
    for m in fence().find_iter(text) {
        parts.push(&text[last..m.start()]);
        parts.push(m.as_str());
        last = m.end();
    }
    parts.push(&text[last..]);

    let mut prose = String::new();
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        let is_opening = i % 2 == 1 && matches!(part, "```" | "```python" | "```py");
        if is_opening && parts.get(i + 2) == Some(&"```") {
            blocks.push(parts[i + 1].to_string());
            i += 3;
        } else {
            prose.push_str(part);
            i += 1;
        }
    }
    (prose, blocks)
}

/// Drop trailing `# => 42` style comments from `print(...)` lines, which
/// models use to fake the output they expect.
pub fn strip_simulated_output(code: &str) -> String {
    code.split('\n')
        .map(|line| {
            if line.trim_start().starts_with("print(") {
                if let Some(index) = line.rfind('#') {
                    return &line[..index];
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
