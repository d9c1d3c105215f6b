use std::path::PathBuf;

use serde_json::Value;

pub(crate) fn required_string(arguments: &Value, key: &str) -> Result<String, String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| format!("missing required string argument '{key}'"))
}

pub(crate) fn optional_string(arguments: &Value, key: &str) -> Result<Option<String>, String> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let raw = value
        .as_str()
        .ok_or_else(|| format!("optional argument '{key}' must be a string"))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(trimmed.to_string()))
}

pub(crate) fn optional_path(arguments: &Value, key: &str) -> Result<Option<PathBuf>, String> {
    Ok(optional_string(arguments, key)?.map(PathBuf::from))
}

pub(crate) fn optional_u64(arguments: &Value, key: &str) -> Result<Option<u64>, String> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let parsed = value
        .as_u64()
        .ok_or_else(|| format!("optional argument '{key}' must be a non-negative integer"))?;
    Ok(Some(parsed))
}

pub(crate) fn optional_usize(arguments: &Value, key: &str) -> Result<Option<usize>, String> {
    Ok(optional_u64(arguments, key)?.map(|value| usize::try_from(value).unwrap_or(usize::MAX)))
}
