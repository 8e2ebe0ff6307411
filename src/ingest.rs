use std::collections::{HashMap, HashSet};

use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::columns::{self, cell, CumulativeLayout, DailyLayout};

pub const NO_ROSTER_MATCH_TEAM: &str = "ERROR: NO ROSTER MATCH";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyOutcome {
    pub success: bool,
    pub log_date: String,
    pub rows_processed: i64,
    pub students_affected: i64,
    pub minutes_processed: i64,
    pub action_taken: String,
    pub records_replaced: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeOutcome {
    pub success: bool,
    pub rows_processed: i64,
    pub students_affected: i64,
    pub students_matched: i64,
    pub students_unmatched: i64,
    pub students_added: i64,
    pub students_removed: i64,
    pub students_updated: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorBonusOutcome {
    pub success: bool,
    pub event_date: String,
    pub count: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterOutcome {
    pub success: bool,
    pub rows_processed: i64,
    pub records_loaded: i64,
    pub students_added: i64,
    pub students_removed: i64,
    pub students_updated: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub success: bool,
    pub rows_processed: i64,
    pub records_loaded: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

struct HistoryRecord<'a> {
    log_date: Option<&'a str>,
    filename: &'a str,
    rows_processed: i64,
    minutes_processed: i64,
    students_affected: i64,
    upload_type: &'a str,
    status: &'a str,
    action_taken: &'a str,
    records_replaced: i64,
    audit_details: serde_json::Value,
}

fn insert_history(conn: &Connection, rec: &HistoryRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO upload_history(
            id, upload_timestamp, log_date, filename, rows_processed,
            minutes_processed, students_affected, upload_type, status,
            action_taken, records_replaced, audit_details)
         VALUES(?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            rec.log_date,
            rec.filename,
            rec.rows_processed,
            rec.minutes_processed,
            rec.students_affected,
            rec.upload_type,
            rec.status,
            rec.action_taken,
            rec.records_replaced,
            rec.audit_details.to_string(),
        ),
    )?;
    Ok(())
}

fn status_for(warnings: &[String]) -> &'static str {
    if warnings.is_empty() {
        "success"
    } else {
        "warning"
    }
}

fn audit_json(
    errors: &[String],
    warnings: &[String],
    info: &[String],
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut audit = json!({
        "errors": errors,
        "warnings": warnings,
        "info": info,
    });
    if let (Some(obj), Some(more)) = (audit.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    audit
}

fn parse_count(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

fn parse_money(raw: &str) -> Option<f64> {
    let t = raw.trim().trim_start_matches('$').replace(',', "");
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok()
}

/// Builds a reader over the raw upload text, or the validation error for an
/// empty/headerless file. Every upload kind funnels through this first.
fn open_csv(csv_text: &str) -> Result<csv::Reader<&[u8]>, String> {
    if csv_text.trim().is_empty() {
        return Err("CSV file is empty".to_string());
    }
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes()))
}

fn read_rows(rdr: &mut csv::Reader<&[u8]>, warnings: &mut Vec<String>) -> Vec<(usize, csv::StringRecord)> {
    let mut out = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let row_no = i + 2; // header is row 1
        match rec {
            Ok(r) => out.push((row_no, r)),
            Err(e) => warnings.push(format!("Row {}: unreadable ({}); skipped", row_no, e)),
        }
    }
    out
}

fn roster_name_set(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT student_name FROM roster")?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().map(|n| columns::norm(n)).collect())
}

fn roster_team_map(conn: &Connection) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT student_name, team_name FROM roster")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(name, team)| (columns::norm(&name), team))
        .collect())
}

// ---------------------------------------------------------------------------
// Daily minutes

struct MergedDaily {
    display_name: String,
    minutes: Vec<i64>,
}

struct ParsedDaily {
    students: Vec<MergedDaily>,
    rows_processed: i64,
    warnings: Vec<String>,
}

fn parse_daily(
    conn: &Connection,
    layout: &DailyLayout,
    rows: Vec<(usize, csv::StringRecord)>,
    warnings: Vec<String>,
) -> rusqlite::Result<ParsedDaily> {
    let roster = roster_name_set(conn)?;
    let mut warnings = warnings;
    let mut students: Vec<MergedDaily> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut rows_processed = 0i64;

    for (row_no, rec) in rows {
        rows_processed += 1;
        let name_raw = cell(&rec, layout.student_name);
        let name = name_raw.trim();
        if name.is_empty() {
            let teacher = layout
                .teacher
                .map(|idx| cell(&rec, idx).trim().to_string())
                .unwrap_or_default();
            if !teacher.is_empty() {
                warnings.push(format!(
                    "Row {}: teacher '{}' with no student name; skipped (template row)",
                    row_no, teacher
                ));
            }
            continue;
        }
        let minutes_raw = cell(&rec, layout.minutes);
        let minutes = match parse_count(minutes_raw) {
            Some(m) if m >= 0 => m,
            Some(m) => {
                warnings.push(format!(
                    "Row {}: negative minutes {} for '{}'; row skipped",
                    row_no, m, name
                ));
                continue;
            }
            None => {
                warnings.push(format!(
                    "Row {}: invalid minutes value '{}' for '{}'; row skipped",
                    row_no,
                    minutes_raw.trim(),
                    name
                ));
                continue;
            }
        };

        let key = columns::norm(name);
        match by_name.get(&key) {
            Some(&idx) => students[idx].minutes.push(minutes),
            None => {
                if !roster.contains(&key) {
                    warnings.push(format!(
                        "Student '{}' not found in roster; imported anyway",
                        name
                    ));
                }
                by_name.insert(key, students.len());
                students.push(MergedDaily {
                    display_name: name.to_string(),
                    minutes: vec![minutes],
                });
            }
        }
    }

    for s in &students {
        if s.minutes.len() > 1 {
            let total: i64 = s.minutes.iter().sum();
            warnings.push(format!(
                "Duplicate rows for '{}': minutes {:?} summed to {}",
                s.display_name, s.minutes, total
            ));
        }
    }

    Ok(ParsedDaily {
        students,
        rows_processed,
        warnings,
    })
}

pub fn upload_daily(conn: &Connection, log_date: &str, csv_text: &str, filename: &str) -> DailyOutcome {
    let mut outcome = DailyOutcome {
        success: false,
        log_date: log_date.to_string(),
        rows_processed: 0,
        students_affected: 0,
        minutes_processed: 0,
        action_taken: String::new(),
        records_replaced: 0,
        errors: Vec::new(),
        warnings: Vec::new(),
        info: Vec::new(),
    };

    let parsed = match parse_daily_file(conn, csv_text) {
        Ok(p) => p,
        Err(FileError::Validation(msg)) => {
            warn!("daily upload rejected: {}", msg);
            outcome.errors.push(msg);
            return outcome;
        }
        Err(FileError::Db(e)) => {
            outcome.errors.push(format!("database error: {}", e));
            return outcome;
        }
    };

    outcome.rows_processed = parsed.rows_processed;
    outcome.warnings = parsed.warnings;
    outcome.students_affected = parsed.students.len() as i64;

    let final_rows: Vec<(String, i64)> = parsed
        .students
        .iter()
        .map(|s| (s.display_name.clone(), s.minutes.iter().sum()))
        .collect();
    outcome.minutes_processed = final_rows.iter().map(|(_, m)| m).sum();

    let existing = match count_daily_rows(conn, log_date) {
        Ok(n) => n,
        Err(e) => {
            outcome.errors.push(format!("database error: {}", e));
            return outcome;
        }
    };
    outcome.records_replaced = existing;
    outcome.action_taken = if existing > 0 { "replaced" } else { "inserted" }.to_string();
    if existing > 0 {
        outcome.info.push(format!(
            "Replaced {} existing records for {}",
            existing, log_date
        ));
    }

    let status = status_for(&outcome.warnings);
    let audit = audit_json(
        &outcome.errors,
        &outcome.warnings,
        &outcome.info,
        json!({ "recordsReplaced": existing }),
    );
    let history = HistoryRecord {
        log_date: Some(log_date),
        filename,
        rows_processed: outcome.rows_processed,
        minutes_processed: outcome.minutes_processed,
        students_affected: outcome.students_affected,
        upload_type: "daily",
        status,
        action_taken: &outcome.action_taken,
        records_replaced: existing,
        audit_details: audit,
    };

    if let Err(e) = write_daily(conn, log_date, &final_rows, &history) {
        outcome.errors.push(format!("database error: {}", e));
        return outcome;
    }

    info!(
        "daily upload {}: {} students, {} minutes, {} warnings",
        log_date,
        outcome.students_affected,
        outcome.minutes_processed,
        outcome.warnings.len()
    );
    outcome.success = true;
    outcome
}

enum FileError {
    Validation(String),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for FileError {
    fn from(e: rusqlite::Error) -> Self {
        FileError::Db(e)
    }
}

fn parse_daily_file(conn: &Connection, csv_text: &str) -> Result<ParsedDaily, FileError> {
    let mut rdr = open_csv(csv_text).map_err(FileError::Validation)?;
    let headers = rdr
        .headers()
        .map_err(|e| FileError::Validation(format!("unreadable CSV header: {}", e)))?
        .clone();
    let layout = columns::resolve_daily(&headers).map_err(FileError::Validation)?;
    let mut warnings = Vec::new();
    let rows = read_rows(&mut rdr, &mut warnings);
    if rows.is_empty() {
        return Err(FileError::Validation("CSV contains no data rows".to_string()));
    }
    Ok(parse_daily(conn, &layout, rows, warnings)?)
}

fn count_daily_rows(conn: &Connection, log_date: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM daily_logs WHERE log_date = ?",
        [log_date],
        |r| r.get(0),
    )
}

fn write_daily(
    conn: &Connection,
    log_date: &str,
    rows: &[(String, i64)],
    history: &HistoryRecord,
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM daily_logs WHERE log_date = ?", [log_date])?;
    for (name, minutes) in rows {
        tx.execute(
            "INSERT INTO daily_logs(id, log_date, student_name, minutes_read)
             VALUES(?, ?, ?, ?)",
            (Uuid::new_v4().to_string(), log_date, name, minutes),
        )?;
    }
    insert_history(&tx, history)?;
    tx.commit()
}

// ---------------------------------------------------------------------------
// Cumulative stats

struct MergedReader {
    display_name: String,
    raised: Vec<f64>,
    sponsors: Vec<i64>,
    minutes: Vec<i64>,
    teacher: String,
}

struct ParsedCumulative {
    readers: Vec<MergedReader>,
    rows_processed: i64,
    warnings: Vec<String>,
}

fn parse_cumulative(
    layout: &CumulativeLayout,
    rows: Vec<(usize, csv::StringRecord)>,
    warnings: Vec<String>,
) -> ParsedCumulative {
    let mut warnings = warnings;
    let mut readers: Vec<MergedReader> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut rows_processed = 0i64;

    for (row_no, rec) in rows {
        rows_processed += 1;
        let name = cell(&rec, layout.student_name).trim().to_string();
        if name.is_empty() {
            let teacher = cell(&rec, layout.teacher).trim().to_string();
            if !teacher.is_empty() {
                warnings.push(format!(
                    "Row {}: teacher '{}' with no student name; skipped (template row)",
                    row_no, teacher
                ));
            }
            continue;
        }

        let raised_raw = cell(&rec, layout.raised);
        let Some(raised) = parse_money(raised_raw) else {
            warnings.push(format!(
                "Row {}: invalid raised amount '{}' for '{}'; row skipped",
                row_no,
                raised_raw.trim(),
                name
            ));
            continue;
        };
        let sponsors_raw = cell(&rec, layout.sponsors);
        let Some(sponsors) = parse_count(sponsors_raw) else {
            warnings.push(format!(
                "Row {}: invalid sponsor count '{}' for '{}'; row skipped",
                row_no,
                sponsors_raw.trim(),
                name
            ));
            continue;
        };
        let minutes_raw = cell(&rec, layout.minutes);
        let Some(minutes) = parse_count(minutes_raw) else {
            warnings.push(format!(
                "Row {}: invalid minutes value '{}' for '{}'; row skipped",
                row_no,
                minutes_raw.trim(),
                name
            ));
            continue;
        };
        if raised < 0.0 || sponsors < 0 || minutes < 0 {
            warnings.push(format!(
                "Row {}: negative value for '{}'; row skipped",
                row_no, name
            ));
            continue;
        }
        let teacher = cell(&rec, layout.teacher).trim().to_string();

        let key = columns::norm(&name);
        match by_name.get(&key) {
            Some(&idx) => {
                let r = &mut readers[idx];
                r.raised.push(raised);
                r.sponsors.push(sponsors);
                r.minutes.push(minutes);
                // Last occurrence's teacher wins.
                r.teacher = teacher;
            }
            None => {
                by_name.insert(key, readers.len());
                readers.push(MergedReader {
                    display_name: name,
                    raised: vec![raised],
                    sponsors: vec![sponsors],
                    minutes: vec![minutes],
                    teacher,
                });
            }
        }
    }

    for r in &readers {
        if r.raised.len() > 1 {
            warnings.push(format!(
                "Duplicate rows for '{}': raised {:?}, sponsors {:?}, minutes {:?} summed across {} rows",
                r.display_name,
                r.raised,
                r.sponsors,
                r.minutes,
                r.raised.len()
            ));
        }
    }

    ParsedCumulative {
        readers,
        rows_processed,
        warnings,
    }
}

pub fn upload_cumulative(conn: &Connection, csv_text: &str, filename: &str) -> CumulativeOutcome {
    let mut outcome = CumulativeOutcome {
        success: false,
        rows_processed: 0,
        students_affected: 0,
        students_matched: 0,
        students_unmatched: 0,
        students_added: 0,
        students_removed: 0,
        students_updated: 0,
        errors: Vec::new(),
        warnings: Vec::new(),
        info: Vec::new(),
    };

    let parsed = match parse_cumulative_file(csv_text) {
        Ok(p) => p,
        Err(msg) => {
            warn!("cumulative upload rejected: {}", msg);
            outcome.errors.push(msg);
            return outcome;
        }
    };
    outcome.rows_processed = parsed.rows_processed;
    outcome.warnings = parsed.warnings;
    outcome.students_affected = parsed.readers.len() as i64;

    let run = (|| -> rusqlite::Result<()> {
        let teams = roster_team_map(conn)?;
        let mut unmatched: Vec<String> = Vec::new();
        let mut final_rows: Vec<(String, f64, i64, i64, String, String)> = Vec::new();
        for r in &parsed.readers {
            let key = columns::norm(&r.display_name);
            let team = match teams.get(&key) {
                Some(t) => {
                    outcome.students_matched += 1;
                    t.clone()
                }
                None => {
                    unmatched.push(r.display_name.clone());
                    NO_ROSTER_MATCH_TEAM.to_string()
                }
            };
            final_rows.push((
                r.display_name.clone(),
                r.raised.iter().sum(),
                r.sponsors.iter().sum(),
                r.minutes.iter().sum(),
                team,
                r.teacher.clone(),
            ));
        }
        outcome.students_unmatched = unmatched.len() as i64;
        if !unmatched.is_empty() {
            outcome.warnings.push(format!(
                "Students not in roster (assigned team '{}'): {}",
                NO_ROSTER_MATCH_TEAM,
                unmatched.join(", ")
            ));
        }

        let old_names: HashSet<String> = {
            let mut stmt = conn.prepare("SELECT student_name FROM reader_cumulative")?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            names.iter().map(|n| columns::norm(n)).collect()
        };
        let new_names: HashSet<String> = final_rows
            .iter()
            .map(|(name, ..)| columns::norm(name))
            .collect();
        outcome.students_added = new_names.difference(&old_names).count() as i64;
        outcome.students_removed = old_names.difference(&new_names).count() as i64;
        outcome.students_updated = new_names.intersection(&old_names).count() as i64;

        let records_replaced = old_names.len() as i64;
        if records_replaced > 0 {
            outcome.info.push(format!(
                "Replaced {} existing cumulative records",
                records_replaced
            ));
        }
        let action_taken = if records_replaced > 0 { "replaced" } else { "inserted" };
        // Unmatched students alone decide the history status here; duplicate
        // and skipped-row warnings do not.
        let status = if outcome.students_unmatched > 0 { "warning" } else { "success" };
        let minutes_processed: i64 = final_rows.iter().map(|r| r.3).sum();
        let audit = audit_json(
            &outcome.errors,
            &outcome.warnings,
            &outcome.info,
            json!({
                "studentsAdded": outcome.students_added,
                "studentsRemoved": outcome.students_removed,
                "studentsUpdated": outcome.students_updated,
                "unmatchedStudents": unmatched,
            }),
        );
        let history = HistoryRecord {
            log_date: None,
            filename,
            rows_processed: outcome.rows_processed,
            minutes_processed,
            students_affected: outcome.students_affected,
            upload_type: "cumulative",
            status,
            action_taken,
            records_replaced,
            audit_details: audit,
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM reader_cumulative", [])?;
        for (name, raised, sponsors, minutes, team, teacher) in &final_rows {
            tx.execute(
                "INSERT INTO reader_cumulative(
                    id, student_name, donation_amount, sponsors, cumulative_minutes,
                    team_name, teacher_name, upload_timestamp)
                 VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                (
                    Uuid::new_v4().to_string(),
                    name,
                    raised,
                    sponsors,
                    minutes,
                    team,
                    teacher,
                ),
            )?;
        }
        insert_history(&tx, &history)?;
        tx.commit()
    })();

    if let Err(e) = run {
        outcome.errors.push(format!("database error: {}", e));
        return outcome;
    }

    info!(
        "cumulative upload: {} students ({} unmatched), added {} removed {} updated {}",
        outcome.students_affected,
        outcome.students_unmatched,
        outcome.students_added,
        outcome.students_removed,
        outcome.students_updated
    );
    outcome.success = true;
    outcome
}

fn parse_cumulative_file(csv_text: &str) -> Result<ParsedCumulative, String> {
    let mut rdr = open_csv(csv_text)?;
    let headers = rdr
        .headers()
        .map_err(|e| format!("unreadable CSV header: {}", e))?
        .clone();
    let layout = columns::resolve_cumulative(&headers)?;
    let mut warnings = Vec::new();
    let rows = read_rows(&mut rdr, &mut warnings);
    if rows.is_empty() {
        return Err("CSV contains no data rows".to_string());
    }
    Ok(parse_cumulative(&layout, rows, warnings))
}

// ---------------------------------------------------------------------------
// Team color bonus

struct BonusRow {
    class_name: String,
    team_name: String,
    students_count: i64,
}

pub fn upload_color_bonus(
    conn: &Connection,
    event_date: &str,
    csv_text: &str,
    filename: &str,
) -> ColorBonusOutcome {
    let mut outcome = ColorBonusOutcome {
        success: false,
        event_date: event_date.to_string(),
        count: 0,
        errors: Vec::new(),
        warnings: Vec::new(),
        info: Vec::new(),
    };

    let mut rdr = match open_csv(csv_text) {
        Ok(r) => r,
        Err(msg) => {
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(e) => {
            outcome.errors.push(format!("unreadable CSV header: {}", e));
            return outcome;
        }
    };
    let layout = match columns::resolve_color_bonus(&headers) {
        Ok(l) => l,
        Err(msg) => {
            warn!("color bonus upload rejected: {}", msg);
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let rows = read_rows(&mut rdr, &mut outcome.warnings);
    if rows.is_empty() {
        outcome.errors.push("CSV contains no data rows".to_string());
        return outcome;
    }

    let run = (|| -> rusqlite::Result<()> {
        // class (normalized) -> (stored-case class name, registered team)
        let classes: HashMap<String, (String, String)> = {
            let mut stmt = conn.prepare("SELECT class_name, team_name FROM class_info")?;
            let pairs = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            pairs
                .into_iter()
                .map(|(class, team)| (columns::norm(&class), (class, team)))
                .collect()
        };

        let mut valid: Vec<BonusRow> = Vec::new();
        for (row_no, rec) in &rows {
            let class_raw = cell(rec, layout.class_name).trim().to_string();
            if class_raw.is_empty() {
                continue;
            }
            let Some((stored_class, registered_team)) = classes.get(&columns::norm(&class_raw))
            else {
                outcome.errors.push(format!(
                    "Row {}: class '{}' not found in class info",
                    row_no, class_raw
                ));
                continue;
            };
            let team_raw = cell(rec, layout.team_name).trim().to_string();
            if columns::norm(&team_raw) != columns::norm(registered_team) {
                outcome.errors.push(format!(
                    "Row {}: team '{}' does not match registered team '{}' for class '{}'",
                    row_no, team_raw, registered_team, stored_class
                ));
                continue;
            }
            let count_raw = cell(rec, layout.students_count);
            let students_count = match parse_count(count_raw) {
                Some(n) if n >= 0 => n,
                _ => {
                    outcome.errors.push(format!(
                        "Row {}: invalid students count '{}' for class '{}'",
                        row_no,
                        count_raw.trim(),
                        stored_class
                    ));
                    continue;
                }
            };
            valid.push(BonusRow {
                class_name: stored_class.clone(),
                team_name: registered_team.clone(),
                students_count,
            });
        }
        outcome.count = valid.len() as i64;

        let mut records_replaced = 0i64;
        for row in &valid {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM team_color_bonus WHERE event_date = ? AND class_name = ?",
                (event_date, &row.class_name),
                |r| r.get(0),
            )?;
            records_replaced += exists;
        }

        let status = if outcome.errors.is_empty() { "success" } else { "warning" };
        let action_taken = if records_replaced > 0 { "replaced" } else { "inserted" };
        let minutes_processed: i64 = valid.iter().map(|r| r.students_count * 10).sum();
        let students_affected: i64 = valid.iter().map(|r| r.students_count).sum();
        let audit = audit_json(
            &outcome.errors,
            &outcome.warnings,
            &outcome.info,
            json!({ "classesLoaded": outcome.count }),
        );
        let history = HistoryRecord {
            log_date: Some(event_date),
            filename,
            rows_processed: rows.len() as i64,
            minutes_processed,
            students_affected,
            upload_type: "color_bonus",
            status,
            action_taken,
            records_replaced,
            audit_details: audit,
        };

        let tx = conn.unchecked_transaction()?;
        for row in &valid {
            tx.execute(
                "INSERT INTO team_color_bonus(
                    event_date, class_name, team_name, students_count,
                    bonus_minutes, bonus_participation_points)
                 VALUES(?, ?, ?, ?, ?, ?)
                 ON CONFLICT(event_date, class_name) DO UPDATE SET
                   team_name = excluded.team_name,
                   students_count = excluded.students_count,
                   bonus_minutes = excluded.bonus_minutes,
                   bonus_participation_points = excluded.bonus_participation_points",
                (
                    event_date,
                    &row.class_name,
                    &row.team_name,
                    row.students_count,
                    row.students_count * 10,
                    row.students_count,
                ),
            )?;
        }
        insert_history(&tx, &history)?;
        tx.commit()
    })();

    if let Err(e) = run {
        outcome.errors.push(format!("database error: {}", e));
        outcome.success = false;
        return outcome;
    }

    info!(
        "color bonus upload {}: {} classes loaded, {} rows rejected",
        event_date,
        outcome.count,
        outcome.errors.len()
    );
    // Partial success: valid rows are committed even when other rows errored.
    outcome.success = outcome.errors.is_empty();
    outcome
}

// ---------------------------------------------------------------------------
// Reference tables

pub fn load_roster(conn: &Connection, csv_text: &str, filename: &str) -> RosterOutcome {
    let mut outcome = RosterOutcome {
        success: false,
        rows_processed: 0,
        records_loaded: 0,
        students_added: 0,
        students_removed: 0,
        students_updated: 0,
        errors: Vec::new(),
        warnings: Vec::new(),
        info: Vec::new(),
    };

    let mut rdr = match open_csv(csv_text) {
        Ok(r) => r,
        Err(msg) => {
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(e) => {
            outcome.errors.push(format!("unreadable CSV header: {}", e));
            return outcome;
        }
    };
    let layout = match columns::resolve_roster(&headers) {
        Ok(l) => l,
        Err(msg) => {
            warn!("roster upload rejected: {}", msg);
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let rows = read_rows(&mut rdr, &mut outcome.warnings);
    if rows.is_empty() {
        outcome.errors.push("CSV contains no data rows".to_string());
        return outcome;
    }

    struct RosterRow {
        student_name: String,
        grade_level: i64,
        class_name: String,
        home_room: String,
        teacher_name: String,
        team_name: String,
    }
    let mut parsed: Vec<RosterRow> = Vec::new();
    for (row_no, rec) in &rows {
        outcome.rows_processed += 1;
        let student_name = cell(rec, layout.student_name).trim().to_string();
        if student_name.is_empty() {
            continue;
        }
        let class_name = cell(rec, layout.class_name).trim().to_string();
        if class_name.is_empty() {
            outcome.warnings.push(format!(
                "Row {}: missing class_name for '{}'; row skipped",
                row_no, student_name
            ));
            continue;
        }
        let grade_raw = cell(rec, layout.grade_level);
        let Some(grade_level) = parse_count(grade_raw) else {
            outcome.warnings.push(format!(
                "Row {}: invalid grade_level '{}' for '{}'; row skipped",
                row_no,
                grade_raw.trim(),
                student_name
            ));
            continue;
        };
        parsed.push(RosterRow {
            student_name,
            grade_level,
            class_name,
            home_room: cell(rec, layout.home_room).trim().to_string(),
            teacher_name: cell(rec, layout.teacher_name).trim().to_string(),
            team_name: cell(rec, layout.team_name).trim().to_string(),
        });
    }

    let run = (|| -> rusqlite::Result<()> {
        let old_names = roster_name_set(conn)?;
        let new_names: HashSet<String> = parsed
            .iter()
            .map(|r| columns::norm(&r.student_name))
            .collect();
        outcome.students_added = new_names.difference(&old_names).count() as i64;
        outcome.students_removed = old_names.difference(&new_names).count() as i64;
        outcome.students_updated = new_names.intersection(&old_names).count() as i64;
        outcome.records_loaded = parsed.len() as i64;

        let records_replaced = old_names.len() as i64;
        if records_replaced > 0 {
            outcome.info.push(format!(
                "Replaced roster of {} students",
                records_replaced
            ));
        }
        let action_taken = if records_replaced > 0 { "replaced" } else { "inserted" };
        let status = status_for(&outcome.warnings);
        let audit = audit_json(
            &outcome.errors,
            &outcome.warnings,
            &outcome.info,
            json!({
                "studentsAdded": outcome.students_added,
                "studentsRemoved": outcome.students_removed,
                "studentsUpdated": outcome.students_updated,
            }),
        );
        let history = HistoryRecord {
            log_date: None,
            filename,
            rows_processed: outcome.rows_processed,
            minutes_processed: 0,
            students_affected: outcome.records_loaded,
            upload_type: "roster",
            status,
            action_taken,
            records_replaced,
            audit_details: audit,
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM roster", [])?;
        for r in &parsed {
            tx.execute(
                "INSERT INTO roster(
                    student_name, grade_level, class_name, home_room, teacher_name, team_name)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    &r.student_name,
                    r.grade_level,
                    &r.class_name,
                    &r.home_room,
                    &r.teacher_name,
                    &r.team_name,
                ),
            )?;
        }
        insert_history(&tx, &history)?;
        tx.commit()
    })();

    if let Err(e) = run {
        outcome.errors.push(format!("database error: {}", e));
        return outcome;
    }

    info!(
        "roster upload: {} students loaded (added {}, removed {}, kept {})",
        outcome.records_loaded,
        outcome.students_added,
        outcome.students_removed,
        outcome.students_updated
    );
    outcome.success = true;
    outcome
}

pub fn load_class_info(conn: &Connection, csv_text: &str, filename: &str) -> LoadOutcome {
    let mut outcome = empty_load_outcome();

    let mut rdr = match open_csv(csv_text) {
        Ok(r) => r,
        Err(msg) => {
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(e) => {
            outcome.errors.push(format!("unreadable CSV header: {}", e));
            return outcome;
        }
    };
    let layout = match columns::resolve_class_info(&headers) {
        Ok(l) => l,
        Err(msg) => {
            warn!("class info upload rejected: {}", msg);
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let rows = read_rows(&mut rdr, &mut outcome.warnings);
    if rows.is_empty() {
        outcome.errors.push("CSV contains no data rows".to_string());
        return outcome;
    }

    struct ClassRow {
        class_name: String,
        home_room: String,
        teacher_name: String,
        grade_level: i64,
        team_name: String,
        total_students: i64,
    }
    let mut parsed: Vec<ClassRow> = Vec::new();
    for (row_no, rec) in &rows {
        outcome.rows_processed += 1;
        let class_name = cell(rec, layout.class_name).trim().to_string();
        if class_name.is_empty() {
            continue;
        }
        let grade_raw = cell(rec, layout.grade_level);
        let Some(grade_level) = parse_count(grade_raw) else {
            outcome.warnings.push(format!(
                "Row {}: invalid grade_level '{}' for class '{}'; row skipped",
                row_no,
                grade_raw.trim(),
                class_name
            ));
            continue;
        };
        let total_raw = cell(rec, layout.total_students);
        let total_students = match parse_count(total_raw) {
            Some(n) if n >= 0 => n,
            _ => {
                outcome.warnings.push(format!(
                    "Row {}: invalid total_students '{}' for class '{}'; row skipped",
                    row_no,
                    total_raw.trim(),
                    class_name
                ));
                continue;
            }
        };
        parsed.push(ClassRow {
            class_name,
            home_room: cell(rec, layout.home_room).trim().to_string(),
            teacher_name: cell(rec, layout.teacher_name).trim().to_string(),
            grade_level,
            team_name: cell(rec, layout.team_name).trim().to_string(),
            total_students,
        });
    }

    let run = (|| -> rusqlite::Result<()> {
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM class_info", [], |r| r.get(0))?;
        outcome.records_loaded = parsed.len() as i64;
        if existing > 0 {
            outcome
                .info
                .push(format!("Replaced {} existing class records", existing));
        }
        let history = HistoryRecord {
            log_date: None,
            filename,
            rows_processed: outcome.rows_processed,
            minutes_processed: 0,
            students_affected: 0,
            upload_type: "class_info",
            status: status_for(&outcome.warnings),
            action_taken: if existing > 0 { "replaced" } else { "inserted" },
            records_replaced: existing,
            audit_details: audit_json(&outcome.errors, &outcome.warnings, &outcome.info, json!({})),
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM class_info", [])?;
        for r in &parsed {
            tx.execute(
                "INSERT INTO class_info(
                    class_name, home_room, teacher_name, grade_level, team_name, total_students)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    &r.class_name,
                    &r.home_room,
                    &r.teacher_name,
                    r.grade_level,
                    &r.team_name,
                    r.total_students,
                ),
            )?;
        }
        insert_history(&tx, &history)?;
        tx.commit()
    })();

    if let Err(e) = run {
        outcome.errors.push(format!("database error: {}", e));
        return outcome;
    }

    info!("class info upload: {} classes loaded", outcome.records_loaded);
    outcome.success = true;
    outcome
}

pub fn load_grade_rules(conn: &Connection, csv_text: &str, filename: &str) -> LoadOutcome {
    let mut outcome = empty_load_outcome();

    let mut rdr = match open_csv(csv_text) {
        Ok(r) => r,
        Err(msg) => {
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(e) => {
            outcome.errors.push(format!("unreadable CSV header: {}", e));
            return outcome;
        }
    };
    let layout = match columns::resolve_grade_rules(&headers) {
        Ok(l) => l,
        Err(msg) => {
            warn!("grade rules upload rejected: {}", msg);
            outcome.errors.push(msg);
            return outcome;
        }
    };
    let rows = read_rows(&mut rdr, &mut outcome.warnings);
    if rows.is_empty() {
        outcome.errors.push("CSV contains no data rows".to_string());
        return outcome;
    }

    // grade_level is the primary key; later file rows win over earlier ones.
    let mut parsed: Vec<(i64, i64, i64)> = Vec::new();
    let mut by_grade: HashMap<i64, usize> = HashMap::new();
    for (row_no, rec) in &rows {
        outcome.rows_processed += 1;
        let grade_raw = cell(rec, layout.grade_level);
        let Some(grade) = parse_count(grade_raw) else {
            if !grade_raw.trim().is_empty() {
                outcome.warnings.push(format!(
                    "Row {}: invalid grade_level '{}'; row skipped",
                    row_no,
                    grade_raw.trim()
                ));
            }
            continue;
        };
        let min_raw = cell(rec, layout.min_daily_minutes);
        let Some(min_daily) = parse_count(min_raw) else {
            outcome.warnings.push(format!(
                "Row {}: invalid min_daily_minutes '{}' for grade {}; row skipped",
                row_no,
                min_raw.trim(),
                grade
            ));
            continue;
        };
        let max_raw = cell(rec, layout.max_daily_minutes_credit);
        let Some(max_credit) = parse_count(max_raw) else {
            outcome.warnings.push(format!(
                "Row {}: invalid max_daily_minutes_credit '{}' for grade {}; row skipped",
                row_no,
                max_raw.trim(),
                grade
            ));
            continue;
        };
        match by_grade.get(&grade) {
            Some(&idx) => {
                outcome.warnings.push(format!(
                    "Row {}: duplicate grade_level {}; later row wins",
                    row_no, grade
                ));
                parsed[idx] = (grade, min_daily, max_credit);
            }
            None => {
                by_grade.insert(grade, parsed.len());
                parsed.push((grade, min_daily, max_credit));
            }
        }
    }

    let run = (|| -> rusqlite::Result<()> {
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM grade_rules", [], |r| r.get(0))?;
        outcome.records_loaded = parsed.len() as i64;
        if existing > 0 {
            outcome
                .info
                .push(format!("Replaced {} existing grade rules", existing));
        }
        let history = HistoryRecord {
            log_date: None,
            filename,
            rows_processed: outcome.rows_processed,
            minutes_processed: 0,
            students_affected: 0,
            upload_type: "grade_rules",
            status: status_for(&outcome.warnings),
            action_taken: if existing > 0 { "replaced" } else { "inserted" },
            records_replaced: existing,
            audit_details: audit_json(&outcome.errors, &outcome.warnings, &outcome.info, json!({})),
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM grade_rules", [])?;
        for (grade, min_daily, max_credit) in &parsed {
            tx.execute(
                "INSERT INTO grade_rules(grade_level, min_daily_minutes, max_daily_minutes_credit)
                 VALUES(?, ?, ?)",
                (grade, min_daily, max_credit),
            )?;
        }
        insert_history(&tx, &history)?;
        tx.commit()
    })();

    if let Err(e) = run {
        outcome.errors.push(format!("database error: {}", e));
        return outcome;
    }

    info!("grade rules upload: {} rules loaded", outcome.records_loaded);
    outcome.success = true;
    outcome
}

fn empty_load_outcome() -> LoadOutcome {
    LoadOutcome {
        success: false,
        rows_processed: 0,
        records_loaded: 0,
        errors: Vec::new(),
        warnings: Vec::new(),
        info: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Upload history

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub upload_timestamp: String,
    pub log_date: Option<String>,
    pub filename: String,
    pub rows_processed: i64,
    pub minutes_processed: i64,
    pub students_affected: i64,
    pub upload_type: String,
    pub status: String,
    pub action_taken: String,
    pub records_replaced: i64,
    pub audit_details: serde_json::Value,
}

pub fn list_history(conn: &Connection, limit: i64) -> rusqlite::Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, upload_timestamp, log_date, filename, rows_processed,
                minutes_processed, students_affected, upload_type, status,
                action_taken, records_replaced, audit_details
         FROM upload_history
         ORDER BY upload_timestamp DESC, rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            let audit_raw: String = r.get(11)?;
            Ok(HistoryEntry {
                id: r.get(0)?,
                upload_timestamp: r.get(1)?,
                log_date: r.get(2)?,
                filename: r.get(3)?,
                rows_processed: r.get(4)?,
                minutes_processed: r.get(5)?,
                students_affected: r.get(6)?,
                upload_type: r.get(7)?,
                status: r.get(8)?,
                action_taken: r.get(9)?,
                records_replaced: r.get(10)?,
                audit_details: serde_json::from_str(&audit_raw)
                    .unwrap_or(serde_json::Value::Null),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Administrative reset. History is append-only otherwise.
pub fn clear_history(conn: &Connection) -> rusqlite::Result<i64> {
    let removed = conn.execute("DELETE FROM upload_history", [])?;
    Ok(removed as i64)
}
