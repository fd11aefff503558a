//! Message rendering.
//!
//! The template body is JSON-with-placeholders: a strict replace of
//! `{{key}}` tokens with the string value of `context[key]`, where the
//! context is the template's defaults overlaid with the job group's context.
//! Unknown keys leave the placeholder intact. No logic, no loops.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};
use crate::model::Template;

/// Render one message body for a recipient. Returns the parsed JSON object.
pub fn build_message(
    template: &Template,
    context: &BTreeMap<String, String>,
) -> Result<Map<String, Value>> {
    let mut merged = template.defaults.clone();
    for (key, value) in context {
        merged.insert(key.clone(), value.clone());
    }

    let mut rendered = serde_json::to_string(&template.body)?;
    for (key, value) in &merged {
        let placeholder = format!("{{{{{}}}}}", key);
        if rendered.contains(&placeholder) {
            rendered = rendered.replace(&placeholder, &escape_json_fragment(value));
        }
    }

    match serde_json::from_str::<Value>(&rendered)? {
        Value::Object(message) => Ok(message),
        other => Err(DispatchError::Data(format!(
            "rendered template is not a JSON object: {}",
            other
        ))),
    }
}

/// Escape a substitution value so it stays valid inside a JSON string
/// literal (the placeholders live inside already-quoted body values).
fn escape_json_fragment(value: &str) -> String {
    match serde_json::to_string(value) {
        Ok(quoted) => quoted[1..quoted.len() - 1].to_string(),
        Err(_) => String::new(),
    }
}
