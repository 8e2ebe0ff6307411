use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_readathond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn readathond");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

const ROSTER_CSV: &str = "student_name,class_name,home_room,teacher_name,grade_level,team_name\n\
Alice Adams,3A,101,Ms. Green,3,Red\n\
Bob Brown,4B,202,Mr. Blue,4,Blue\n";

const RULES_CSV: &str = "grade_level,min_daily_minutes,max_daily_minutes_credit\n3,20,120\n4,25,120\n";

fn load_year(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    file_name: &str,
    log_date: &str,
    alice_minutes: i64,
    raised: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        "y1",
        "contest.create",
        json!({ "fileName": file_name }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "y2",
        "contest.activate",
        json!({ "fileName": file_name }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "y3",
        "uploads.roster",
        json!({ "csv": ROSTER_CSV, "filename": "roster.csv" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "y4",
        "uploads.gradeRules",
        json!({ "csv": RULES_CSV, "filename": "rules.csv" }),
    );
    let daily = format!(
        "Name,Minutes\nAlice Adams,{}\nBob Brown,{}\n",
        alice_minutes,
        alice_minutes / 2
    );
    let _ = request_ok(
        stdin,
        reader,
        "y5",
        "uploads.daily",
        json!({ "date": log_date, "csv": daily, "filename": "day1.csv" }),
    );
    let cume = format!(
        "Name,Teacher,Raised,Sponsors,Minutes\nAlice Adams,Ms. Green,{},2,{}\n",
        raised, alice_minutes
    );
    let _ = request_ok(
        stdin,
        reader,
        "y6",
        "uploads.cumulative",
        json!({ "csv": cume, "filename": "cume.csv" }),
    );
}

fn find_row<'a>(
    report: &'a serde_json::Value,
    level: &str,
    metric: &str,
) -> &'a serde_json::Value {
    report
        .get("rows")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter().find(|r| {
                r.get("entityLevel") == Some(&json!(level)) && r.get("metric") == Some(&json!(metric))
            })
        })
        .unwrap_or_else(|| panic!("missing row {} / {}", level, metric))
}

#[test]
fn comparing_two_years_ranks_each_metric() {
    let workspace = temp_dir("readathon-compare-years");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    load_year(&mut stdin, &mut reader, "2023.sqlite3", "2023-03-01", 40, "$10.00");
    load_year(&mut stdin, &mut reader, "2024.sqlite3", "2024-03-04", 60, "$25.00");

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "compare.run",
        json!({ "db1": "2023.sqlite3", "db2": "2024.sqlite3" }),
    );
    assert_eq!(report.get("db1Label"), Some(&json!("2023.sqlite3")));

    let minutes = find_row(&report, "School", "total_minutes");
    assert_eq!(minutes.get("db1Value"), Some(&json!(60.0)));
    assert_eq!(minutes.get("db2Value"), Some(&json!(90.0)));
    assert_eq!(minutes.get("winner"), Some(&json!("db2")));
    let change = minutes.get("change").expect("change object");
    assert_eq!(change.get("absolute"), Some(&json!(30.0)));
    assert_eq!(change.get("direction"), Some(&json!("up")));

    let raised = find_row(&report, "School", "total_raised");
    assert_eq!(raised.get("db1Value"), Some(&json!(10.0)));
    assert_eq!(raised.get("db2Value"), Some(&json!(25.0)));
    assert_eq!(raised.get("honorsFilter"), Some(&json!(false)));

    let student = find_row(&report, "Student", "total_minutes");
    assert_eq!(student.get("db1Holders"), Some(&json!("Alice Adams")));
    assert_eq!(student.get("db2Holders"), Some(&json!("Alice Adams")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn day_one_resolves_to_each_databases_own_first_date() {
    let workspace = temp_dir("readathon-compare-day1");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    load_year(&mut stdin, &mut reader, "2023.sqlite3", "2023-03-01", 40, "$10.00");
    load_year(&mut stdin, &mut reader, "2024.sqlite3", "2024-03-04", 60, "$25.00");

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "compare.run",
        json!({ "db1": "2023.sqlite3", "db2": "2024.sqlite3", "day": 1 }),
    );
    assert_eq!(report.get("day"), Some(&json!(1)));
    assert_eq!(report.get("db1DayDate"), Some(&json!("2023-03-01")));
    assert_eq!(report.get("db2DayDate"), Some(&json!("2024-03-04")));

    let minutes = find_row(&report, "School", "total_minutes");
    assert_eq!(minutes.get("db1Value"), Some(&json!(60.0)));
    assert_eq!(minutes.get("db2Value"), Some(&json!(90.0)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn out_of_range_day_nulls_minutes_but_keeps_money() {
    let workspace = temp_dir("readathon-compare-range");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    load_year(&mut stdin, &mut reader, "2023.sqlite3", "2023-03-01", 40, "$10.00");
    load_year(&mut stdin, &mut reader, "2024.sqlite3", "2024-03-04", 60, "$25.00");

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "compare.run",
        json!({ "db1": "2023.sqlite3", "db2": "2024.sqlite3", "day": 2 }),
    );
    assert_eq!(report.get("db1DayDate"), Some(&json!(null)));
    assert_eq!(report.get("db2DayDate"), Some(&json!(null)));

    let minutes = find_row(&report, "School", "total_minutes");
    assert_eq!(minutes.get("db1Value"), Some(&json!(null)));
    assert_eq!(minutes.get("db2Value"), Some(&json!(null)));
    assert_eq!(minutes.get("winner"), Some(&json!(null)));
    assert_eq!(minutes.get("change"), Some(&json!(null)));

    let raised = find_row(&report, "School", "total_raised");
    assert_eq!(raised.get("db1Value"), Some(&json!(10.0)));
    assert_eq!(raised.get("db2Value"), Some(&json!(25.0)));
    assert_eq!(raised.get("winner"), Some(&json!("db2")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn comparing_a_database_to_itself_ties_everywhere() {
    let workspace = temp_dir("readathon-compare-self");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    load_year(&mut stdin, &mut reader, "2024.sqlite3", "2024-03-04", 60, "$25.00");

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "compare.run",
        json!({ "db1": "2024.sqlite3", "db2": "2024.sqlite3" }),
    );
    let rows = report
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .clone();
    assert_eq!(rows.len(), 49);
    for row in &rows {
        assert_eq!(
            row.get("winner"),
            Some(&json!("tie")),
            "row not tied: {}",
            row
        );
        assert_eq!(
            row.get("change").and_then(|c| c.get("direction")),
            Some(&json!("same"))
        );
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
