//! Best-effort detection of tool-call and handoff directives embedded in
//! free-text model output. Free text routinely fails to parse as JSON, so
//! every failure here means "no directive present", never an error.

use serde_json::Value;

/// A structured instruction recovered from model output. Handoff detection
/// wins over tool detection when both keys are present.
#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    ToolCall { name: String, args: Value },
    Handoff { to: String, reason: Option<String> },
}

pub fn parse_directive(content: &str) -> Option<Directive> {
    let value = extract_json(content)?;
    let object = value.as_object()?;

    if let Some(to) = object.get("handoff").and_then(Value::as_str) {
        let reason = object
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Some(Directive::Handoff {
            to: to.to_string(),
            reason,
        });
    }

    let name = object.get("tool").and_then(Value::as_str)?;
    let args = object.get("args")?.clone();
    Some(Directive::ToolCall {
        name: name.to_string(),
        args,
    })
}

/// Strict decode first; otherwise the span from the first `{` to the last
/// `}` gets one more attempt. Anything else is not JSON.
pub(crate) fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start >= end {
        return None;
    }

    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}
