use rusqlite::Connection;
use serde_json::json;

use super::{get_required_str, optional_date, to_json};
use crate::columns::norm;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, GroupBy, WinnerCandidate};

fn contest_days(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let days = stats::contest_days(conn)?;
    Ok(json!({ "days": days, "count": days.len() }))
}

fn summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let raw = get_required_str(params, "groupBy")?;
    let group_by = GroupBy::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params("groupBy must be one of class, team, grade, school")
    })?;
    let date = optional_date(params, "date")?;
    let rollups = stats::summary(conn, group_by, date.as_deref())?;
    Ok(json!({ "groups": to_json(&rollups)? }))
}

fn students(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = optional_date(params, "date")?;
    let rollups = stats::students(conn, date.as_deref())?;
    Ok(json!({ "students": to_json(&rollups)? }))
}

/// School-wide winners rank individual readers; team, class and grade
/// winners rank the rollups of those groups.
fn winners(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let level = norm(&get_required_str(params, "level")?);
    let metric = get_required_str(params, "metric")?;
    let date = optional_date(params, "date")?;

    let candidates: Vec<WinnerCandidate> = match level.as_str() {
        "school" => {
            if !stats::is_student_metric(&metric) {
                return Err(HandlerErr::bad_params(format!(
                    "unknown student metric: {}",
                    metric
                )));
            }
            stats::students(conn, date.as_deref())?
                .iter()
                .filter_map(|r| {
                    stats::student_metric_value(r, &metric).map(|value| WinnerCandidate {
                        name: r.student_name.clone(),
                        grade: Some(r.grade_level),
                        value,
                    })
                })
                .collect()
        }
        "team" | "class" | "grade" => {
            if !stats::is_group_metric(&metric) {
                return Err(HandlerErr::bad_params(format!(
                    "unknown group metric: {}",
                    metric
                )));
            }
            let group_by = match level.as_str() {
                "team" => GroupBy::Team,
                "class" => GroupBy::Class,
                _ => GroupBy::Grade,
            };
            stats::summary(conn, group_by, date.as_deref())?
                .iter()
                .filter_map(|r| {
                    stats::group_metric_value(r, &metric).map(|value| WinnerCandidate {
                        name: r.group_key.clone(),
                        grade: r.grade_level,
                        value,
                    })
                })
                .collect()
        }
        _ => {
            return Err(HandlerErr::bad_params(
                "level must be one of school, team, class, grade",
            ))
        }
    };

    let winner = stats::select_winners(&metric, &candidates);
    let mut result = to_json(&winner)?;
    result["level"] = json!(level);
    Ok(result)
}

fn grade_winners(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let metric = get_required_str(params, "metric")?;
    if !stats::is_student_metric(&metric) {
        return Err(HandlerErr::bad_params(format!(
            "unknown student metric: {}",
            metric
        )));
    }
    let date = optional_date(params, "date")?;
    let boards = stats::grade_winners(conn, &metric, date.as_deref())?;
    Ok(json!({ "grades": to_json(&boards)? }))
}

fn integrity(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let report = stats::integrity_report(conn)?;
    to_json(&report)
}

fn with_db(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "no active contest database", None);
    };
    match f(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.contestDays" => Some(with_db(state, req, |conn, _| contest_days(conn))),
        "stats.summary" => Some(with_db(state, req, summary)),
        "stats.students" => Some(with_db(state, req, students)),
        "stats.winners" => Some(with_db(state, req, winners)),
        "stats.gradeWinners" => Some(with_db(state, req, grade_winners)),
        "stats.integrity" => Some(with_db(state, req, |conn, _| integrity(conn))),
        _ => None,
    }
}
