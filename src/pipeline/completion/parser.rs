use serde_json::Value;

use super::types::{HeaderClaim, RepairAnswer};
use super::CompletionError;

/// Locate the JSON payload in a model response.
///
/// Accepts a fenced ```json block, a bare fence, or the outermost `{...}`.
pub fn extract_json_block(response: &str) -> Result<&str, CompletionError> {
    if let Some(start) = response.find("```json") {
        let body_start = start + 7;
        let end = response[body_start..]
            .find("```")
            .ok_or_else(|| CompletionError::MalformedResponse("Unclosed JSON block".into()))?;
        return Ok(response[body_start..body_start + end].trim());
    }

    if let Some(start) = response.find("```") {
        let body_start = start + 3;
        if let Some(end) = response[body_start..].find("```") {
            let inner = response[body_start..body_start + end].trim();
            if inner.starts_with('{') {
                return Ok(inner);
            }
        }
    }

    let open = response.find('{');
    let close = response.rfind('}');
    match (open, close) {
        (Some(open), Some(close)) if close > open => Ok(&response[open..=close]),
        _ => Err(CompletionError::MalformedResponse("No JSON object found".into())),
    }
}

/// Parse `{"headers": [{"element_id": .., "section_id": ..}, ..]}`.
///
/// Items that fail to parse are skipped.
pub fn parse_header_list(response: &str) -> Result<Vec<HeaderClaim>, CompletionError> {
    let json = extract_json_block(response)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| CompletionError::JsonParsing(e.to_string()))?;

    let items = value
        .get("headers")
        .and_then(Value::as_array)
        .ok_or_else(|| CompletionError::MalformedResponse("Missing 'headers' array".into()))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            Some(HeaderClaim {
                element_id: item.get("element_id")?.as_str()?.to_string(),
                section_id: coerce_u32(item.get("section_id")?)?,
            })
        })
        .collect())
}

/// Parse `{"element_id": .., "section_id": ..}`; nulls mean "not found".
pub fn parse_repair_answer(response: &str) -> Result<RepairAnswer, CompletionError> {
    let json = extract_json_block(response)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| CompletionError::JsonParsing(e.to_string()))?;
    if !value.is_object() {
        return Err(CompletionError::MalformedResponse("Expected a JSON object".into()));
    }

    Ok(RepairAnswer {
        element_id: value
            .get("element_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
        section_id: value.get("section_id").and_then(coerce_u32),
    })
}

/// Models answer numbers as `80`, `"80"` or `80.0`.
fn coerce_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
