use std::path::Path;

use rusqlite::Connection;
use serde_json::json;

use super::{get_optional_i64, get_optional_str, get_required_str};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

pub(super) fn validate_file_name(name: &str) -> Result<(), HandlerErr> {
    if name.trim().is_empty() {
        return Err(HandlerErr::bad_params("fileName must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(HandlerErr::bad_params("fileName must be a bare file name"));
    }
    if name == db::REGISTRY_FILE {
        return Err(HandlerErr::bad_params(format!(
            "'{}' is reserved for the workspace registry",
            db::REGISTRY_FILE
        )));
    }
    Ok(())
}

fn entry_json(e: &db::DatabaseEntry) -> serde_json::Value {
    json!({
        "id": e.id,
        "fileName": e.file_name,
        "label": e.label,
        "contestYear": e.contest_year,
        "isActive": e.is_active,
        "createdAt": e.created_at,
    })
}

fn create_database(
    registry: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let file_name = get_required_str(params, "fileName")?;
    validate_file_name(&file_name)?;
    let label = get_optional_str(params, "label").unwrap_or_else(|| file_name.clone());
    let contest_year = get_optional_i64(params, "contestYear");

    let known: i64 = registry.query_row(
        "SELECT COUNT(*) FROM database_metadata WHERE file_name = ?",
        [file_name.as_str()],
        |r| r.get(0),
    )?;
    if known > 0 {
        return Err(HandlerErr::new(
            "already_exists",
            format!("database '{}' is already registered", file_name),
        ));
    }

    // Create the file with its schema before registering it, so a failed
    // create never leaves a registry row pointing at nothing.
    db::open_contest_db(&workspace.join(&file_name))
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    let id = db::register_database(registry, &file_name, &label, contest_year)
        .map_err(|e| HandlerErr::new("db_insert_failed", format!("{e:?}")))?;

    Ok(json!({
        "id": id,
        "fileName": file_name,
        "label": label,
        "contestYear": contest_year,
    }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(workspace), Some(registry)) = (state.workspace.as_ref(), state.registry.as_ref())
    else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    match create_database(registry, workspace, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(registry) = state.registry.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    match db::list_databases(registry) {
        Ok(entries) => ok(
            &req.id,
            json!({ "databases": entries.iter().map(entry_json).collect::<Vec<_>>() }),
        ),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:?}"), None),
    }
}

fn handle_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let file_name = match get_required_str(&req.params, "fileName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = validate_file_name(&file_name) {
        return e.response(&req.id);
    }

    {
        let Some(registry) = state.registry.as_ref() else {
            return err(&req.id, "no_workspace", "no workspace selected", None);
        };
        match db::activate_database(registry, &file_name) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    format!("database '{}' is not registered", file_name),
                    None,
                )
            }
            Err(e) => return err(&req.id, "db_update_failed", format!("{e:?}"), None),
        }
    }

    match db::open_contest_db(&workspace.join(&file_name)) {
        Ok(conn) => {
            state.db = Some(conn);
            state.active_file = Some(file_name.clone());
            ok(&req.id, json!({ "activated": file_name }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "contest.create" => Some(handle_create(state, req)),
        "contest.list" => Some(handle_list(state, req)),
        "contest.activate" => Some(handle_activate(state, req)),
        _ => None,
    }
}
