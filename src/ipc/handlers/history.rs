use rusqlite::Connection;
use serde_json::json;

use super::{get_optional_i64, to_json};
use crate::ingest;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let limit = get_optional_i64(params, "limit").unwrap_or(100);
    if limit < 1 {
        return Err(HandlerErr::bad_params("limit must be >= 1"));
    }
    let entries = ingest::list_history(conn, limit)?;
    Ok(json!({ "history": to_json(&entries)? }))
}

fn clear(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let removed = ingest::clear_history(conn)?;
    Ok(json!({ "removed": removed }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    match list(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    match clear(conn) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "history.list" => Some(handle_list(state, req)),
        "history.clear" => Some(handle_clear(state, req)),
        _ => None,
    }
}
