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

fn strings(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "contest.create",
        json!({ "fileName": "contest.sqlite3" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "contest.activate",
        json!({ "fileName": "contest.sqlite3" }),
    );
    let roster = "student_name,class_name,home_room,teacher_name,grade_level,team_name\n\
                  Alice Adams,3A,101,Ms. Green,3,Red\n\
                  Bob Brown,4B,202,Mr. Blue,4,Blue\n";
    let _ = request_ok(
        stdin,
        reader,
        "s4",
        "uploads.roster",
        json!({ "csv": roster, "filename": "roster.csv" }),
    );
    let classes = "class_name,home_room,teacher_name,grade_level,team_name,total_students\n\
                   3A,101,Ms. Green,3,Red,1\n\
                   4B,202,Mr. Blue,4,Blue,1\n";
    let _ = request_ok(
        stdin,
        reader,
        "s5",
        "uploads.classInfo",
        json!({ "csv": classes, "filename": "classes.csv" }),
    );
}

#[test]
fn valid_rows_commit_even_when_other_rows_fail() {
    let workspace = temp_dir("readathon-bonus-partial");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace);

    // One good row, one unknown class, one class registered to another team.
    let csv = "timestamp,class_name,team_name,grade_level,students_count\n\
               x,3A,Red,3,5\n\
               x,9Z,Gold,9,4\n\
               x,4B,Red,4,3\n";
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "uploads.colorBonus",
        json!({ "date": "2024-03-01", "csv": csv, "filename": "spirit-day.csv" }),
    );
    assert_eq!(outcome.get("success"), Some(&json!(false)));
    assert_eq!(outcome.get("count"), Some(&json!(1)));
    let errors = strings(&outcome, "errors");
    assert_eq!(errors.len(), 2);
    assert!(
        errors.iter().any(|e| e.contains("class '9Z' not found")),
        "errors: {:?}",
        errors
    );
    assert!(
        errors
            .iter()
            .any(|e| e.contains("does not match registered team 'Blue'")),
        "errors: {:?}",
        errors
    );

    // The good row landed: 5 students -> 50 bonus minutes, 5 points.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "stats.summary",
        json!({ "groupBy": "class" }),
    );
    let groups = summary
        .get("groups")
        .and_then(|v| v.as_array())
        .expect("class groups")
        .clone();
    let class_3a = groups
        .iter()
        .find(|g| g.get("groupKey") == Some(&json!("3A")))
        .expect("3A rollup");
    assert_eq!(class_3a.get("colorPoints"), Some(&json!(5)));
    assert_eq!(
        class_3a.get("totalMinutesWithBonus"),
        Some(&json!(50))
    );
    let class_4b = groups
        .iter()
        .find(|g| g.get("groupKey") == Some(&json!("4B")))
        .expect("4B rollup");
    assert_eq!(class_4b.get("colorPoints"), Some(&json!(0)));

    let history = request_ok(&mut stdin, &mut reader, "3", "history.list", json!({}));
    let newest = history
        .get("history")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("history row")
        .clone();
    assert_eq!(newest.get("uploadType"), Some(&json!("color_bonus")));
    assert_eq!(newest.get("status"), Some(&json!("warning")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reuploading_an_event_date_overwrites_per_class() {
    let workspace = temp_dir("readathon-bonus-overwrite");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace);

    let first = "timestamp,class_name,team_name,grade_level,students_count\nx,3A,Red,3,5\n";
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "uploads.colorBonus",
        json!({ "date": "2024-03-01", "csv": first, "filename": "spirit-day.csv" }),
    );

    let corrected = "timestamp,class_name,team_name,grade_level,students_count\nx,3A,Red,3,8\n";
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "uploads.colorBonus",
        json!({ "date": "2024-03-01", "csv": corrected, "filename": "spirit-day-fixed.csv" }),
    );
    assert_eq!(outcome.get("success"), Some(&json!(true)));

    let history = request_ok(&mut stdin, &mut reader, "3", "history.list", json!({}));
    let newest = history
        .get("history")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("history row")
        .clone();
    assert_eq!(newest.get("actionTaken"), Some(&json!("replaced")));
    assert_eq!(newest.get("recordsReplaced"), Some(&json!(1)));

    // The corrected count fully replaces the old one.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "stats.summary",
        json!({ "groupBy": "class" }),
    );
    let class_3a = summary
        .get("groups")
        .and_then(|v| v.as_array())
        .and_then(|a| {
            a.iter()
                .find(|g| g.get("groupKey") == Some(&json!("3A")))
                .cloned()
        })
        .expect("3A rollup");
    assert_eq!(class_3a.get("colorPoints"), Some(&json!(8)));
    assert_eq!(class_3a.get("totalMinutesWithBonus"), Some(&json!(80)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
