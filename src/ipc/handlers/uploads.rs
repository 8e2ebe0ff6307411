use crate::ingest;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

use super::{filename_param, get_required_str, require_date, to_json};

// Upload outcomes are results, not protocol errors: a rejected file comes
// back as ok=true with success=false and the outcome's error list, which is
// what the upload screen renders. Protocol errors are reserved for missing
// params and missing state.
fn respond<T: serde::Serialize>(req: &Request, outcome: &T) -> serde_json::Value {
    match to_json(outcome) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_daily(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    let date = match require_date(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let csv = match get_required_str(&req.params, "csv") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filename = filename_param(&req.params);
    respond(req, &ingest::upload_daily(conn, &date, &csv, &filename))
}

fn handle_cumulative(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    let csv = match get_required_str(&req.params, "csv") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filename = filename_param(&req.params);
    respond(req, &ingest::upload_cumulative(conn, &csv, &filename))
}

fn handle_color_bonus(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    let date = match require_date(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let csv = match get_required_str(&req.params, "csv") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filename = filename_param(&req.params);
    respond(req, &ingest::upload_color_bonus(conn, &date, &csv, &filename))
}

fn handle_roster(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    let csv = match get_required_str(&req.params, "csv") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filename = filename_param(&req.params);
    respond(req, &ingest::load_roster(conn, &csv, &filename))
}

fn handle_class_info(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    let csv = match get_required_str(&req.params, "csv") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filename = filename_param(&req.params);
    respond(req, &ingest::load_class_info(conn, &csv, &filename))
}

fn handle_grade_rules(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    let csv = match get_required_str(&req.params, "csv") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filename = filename_param(&req.params);
    respond(req, &ingest::load_grade_rules(conn, &csv, &filename))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "uploads.daily" => Some(handle_daily(state, req)),
        "uploads.cumulative" => Some(handle_cumulative(state, req)),
        "uploads.colorBonus" => Some(handle_color_bonus(state, req)),
        "uploads.roster" => Some(handle_roster(state, req)),
        "uploads.classInfo" => Some(handle_class_info(state, req)),
        "uploads.gradeRules" => Some(handle_grade_rules(state, req)),
        _ => None,
    }
}
