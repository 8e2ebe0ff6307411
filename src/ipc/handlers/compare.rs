use std::path::{Path, PathBuf};

use super::{get_optional_i64, get_required_str, to_json};
use crate::compare;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn resolve_db_file(workspace: &Path, params: &serde_json::Value, key: &str) -> Result<(PathBuf, String), HandlerErr> {
    let name = get_required_str(params, key)?;
    super::contest::validate_file_name(&name)?;
    let path = workspace.join(&name);
    if !path.is_file() {
        return Err(HandlerErr::new(
            "not_found",
            format!("database file not found: {}", name),
        ));
    }
    Ok((path, name))
}

fn run(workspace: &Path, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (path1, name1) = resolve_db_file(workspace, params, "db1")?;
    let (path2, name2) = resolve_db_file(workspace, params, "db2")?;
    let day = get_optional_i64(params, "day");
    if let Some(n) = day {
        if n < 1 {
            return Err(HandlerErr::bad_params("day must be >= 1"));
        }
    }

    // Two independent connections; the active database stays untouched.
    let conn1 = db::open_contest_db(&path1)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    let conn2 = db::open_contest_db(&path2)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;

    let report = compare::run(&conn1, &conn2, &name1, &name2, day)?;
    to_json(&report)
}

fn handle_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    match run(workspace, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "compare.run" => Some(handle_run(state, req)),
        _ => None,
    }
}
