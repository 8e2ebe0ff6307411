pub mod compare;
pub mod contest;
pub mod core;
pub mod history;
pub mod stats;
pub mod uploads;

use chrono::NaiveDate;

use crate::ipc::error::HandlerErr;

pub(crate) fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub(crate) fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub(crate) fn get_optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub(crate) fn filename_param(params: &serde_json::Value) -> String {
    get_optional_str(params, "filename").unwrap_or_else(|| "unnamed.csv".to_string())
}

fn check_date(raw: &str, key: &str) -> Result<String, HandlerErr> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(d) => Ok(d.format("%Y-%m-%d").to_string()),
        Err(_) => Err(HandlerErr::bad_params(format!(
            "{} must be YYYY-MM-DD, got '{}'",
            key, raw
        ))),
    }
}

pub(crate) fn require_date(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    check_date(&raw, key)
}

pub(crate) fn optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key) {
        Some(raw) => check_date(&raw, key).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}
