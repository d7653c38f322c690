//! Extraction of a tool invocation from a free-form model reply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{"tool": string, "args": object, "explain"?: string}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub tool_name: String,
    pub args: Map<String, Value>,
    pub explanation: Option<String>,
}

impl Invocation {
    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

/// Returns `None` for a plain conversational reply.
pub fn parse_invocation(text: &str) -> Option<Invocation> {
    let body = strip_code_fences(text.trim());

    if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
        if let Some(invocation) = from_value(value) {
            return Some(invocation);
        }
    }

    let start = find_tool_object(&body)?;
    let end = matching_brace(&body, start)?;
    let value = serde_json::from_str::<Value>(&body[start..end]).ok()?;
    from_value(value)
}

fn from_value(value: Value) -> Option<Invocation> {
    let mut object = match value {
        Value::Object(object) => object,
        _ => return None,
    };

    let tool_name = match object.remove("tool")? {
        Value::String(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return None,
    };
    let args = match object.remove("args")? {
        Value::Object(args) => args,
        _ => return None,
    };
    let explanation = match object.remove("explain") {
        Some(Value::String(text)) => Some(text),
        _ => None,
    };

    Some(Invocation {
        tool_name,
        args,
        explanation,
    })
}

/// Keeps only the lines between fence markers when the reply opens with one.
fn strip_code_fences(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_string();
    }

    let mut inside = false;
    let mut kept = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            continue;
        }
        if inside {
            kept.push(line);
        }
    }
    kept.join("\n")
}

/// Byte offset of the first `{` whose first key is `"tool"`.
fn find_tool_object(text: &str) -> Option<usize> {
    text.match_indices('{').map(|(i, _)| i).find(|&i| {
        text[i + 1..]
            .trim_start()
            .starts_with("\"tool\"")
    })
}

/// Exclusive end of the object opening at `start`. Braces inside string
/// literals are ignored.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}
