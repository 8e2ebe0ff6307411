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
                  Bob Brown,3A,101,Ms. Green,3,Red\n";
    let _ = request_ok(
        stdin,
        reader,
        "s4",
        "uploads.roster",
        json!({ "csv": roster, "filename": "roster.csv" }),
    );
}

#[test]
fn reload_reports_added_removed_updated_against_previous_snapshot() {
    let workspace = temp_dir("readathon-cume-diff");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "uploads.cumulative",
        json!({
            "csv": "Name,Teacher,Raised,Sponsors,Minutes\n\
                    Alice Adams,Ms. Green,$10.00,1,100\n\
                    Ghost Reader,Ms. X,$5.00,1,50\n",
            "filename": "week1.csv"
        }),
    );
    assert_eq!(first.get("success"), Some(&json!(true)));
    assert_eq!(first.get("studentsMatched"), Some(&json!(1)));
    assert_eq!(first.get("studentsUnmatched"), Some(&json!(1)));
    assert_eq!(first.get("studentsAdded"), Some(&json!(2)));
    assert_eq!(first.get("studentsRemoved"), Some(&json!(0)));
    let warnings = strings(&first, "warnings");
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("Ghost Reader") && w.contains("ERROR: NO ROSTER MATCH")),
        "warnings: {:?}",
        warnings
    );

    let history = request_ok(&mut stdin, &mut reader, "2", "history.list", json!({}));
    let newest = history
        .get("history")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("history row")
        .clone();
    assert_eq!(newest.get("uploadType"), Some(&json!("cumulative")));
    assert_eq!(newest.get("status"), Some(&json!("warning")));

    // Week two: Ghost is gone, Bob appears, Alice's totals change.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "uploads.cumulative",
        json!({
            "csv": "Name,Teacher,Raised,Sponsors,Minutes\n\
                    Alice Adams,Ms. Green,$22.00,2,180\n\
                    Bob Brown,Ms. Green,$8.00,1,90\n",
            "filename": "week2.csv"
        }),
    );
    assert_eq!(second.get("studentsAdded"), Some(&json!(1)));
    assert_eq!(second.get("studentsRemoved"), Some(&json!(1)));
    assert_eq!(second.get("studentsUpdated"), Some(&json!(1)));
    assert_eq!(second.get("studentsUnmatched"), Some(&json!(0)));

    let history = request_ok(&mut stdin, &mut reader, "4", "history.list", json!({}));
    let newest = history
        .get("history")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("history row")
        .clone();
    assert_eq!(newest.get("status"), Some(&json!("success")));
    assert_eq!(newest.get("actionTaken"), Some(&json!("replaced")));
    assert_eq!(newest.get("recordsReplaced"), Some(&json!(2)));

    // The snapshot is a full replacement: Ghost's money is gone.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "stats.summary",
        json!({ "groupBy": "school" }),
    );
    let school = summary
        .get("groups")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("school rollup")
        .clone();
    assert_eq!(school.get("totalRaised"), Some(&json!(30.0)));
    assert_eq!(school.get("totalSponsors"), Some(&json!(3)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_reader_rows_sum_money_and_minutes() {
    let workspace = temp_dir("readathon-cume-dups");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace);

    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "uploads.cumulative",
        json!({
            "csv": "Name,Teacher,Raised,Sponsors,Minutes\n\
                    Alice Adams,Ms. Green,\"$1,200.50\",2,100\n\
                    Alice Adams,Ms. Green,$34.00,1,40\n",
            "filename": "merged.csv"
        }),
    );
    assert_eq!(outcome.get("success"), Some(&json!(true)));
    assert_eq!(outcome.get("studentsAffected"), Some(&json!(1)));

    let students = request_ok(&mut stdin, &mut reader, "2", "stats.students", json!({}));
    let alice = students
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| {
            a.iter()
                .find(|s| s.get("studentName") == Some(&json!("Alice Adams")))
        })
        .expect("alice")
        .clone();
    assert_eq!(alice.get("donationAmount"), Some(&json!(1234.5)));
    assert_eq!(alice.get("sponsors"), Some(&json!(3)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn daily_shaped_file_is_rejected_as_wrong_kind() {
    let workspace = temp_dir("readathon-cume-wrongkind");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace);

    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "uploads.cumulative",
        json!({
            "csv": "Name,Minutes\nAlice Adams,30\n",
            "filename": "daily-by-mistake.csv"
        }),
    );
    assert_eq!(outcome.get("success"), Some(&json!(false)));
    let errors = strings(&outcome, "errors");
    assert!(
        errors.iter().any(|e| e.contains("daily minutes file")),
        "errors: {:?}",
        errors
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn sentinel_team_surfaces_in_team_rollups() {
    let workspace = temp_dir("readathon-cume-sentinel");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "uploads.cumulative",
        json!({
            "csv": "Name,Teacher,Raised,Sponsors,Minutes\n\
                    Alice Adams,Ms. Green,$10.00,1,100\n\
                    Ghost Reader,Ms. X,$5.00,1,50\n",
            "filename": "week1.csv"
        }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "stats.summary",
        json!({ "groupBy": "team" }),
    );
    let groups = summary
        .get("groups")
        .and_then(|v| v.as_array())
        .expect("team groups")
        .clone();
    let sentinel = groups
        .iter()
        .find(|g| g.get("groupKey") == Some(&json!("ERROR: NO ROSTER MATCH")))
        .expect("sentinel team group");
    assert_eq!(sentinel.get("studentCount"), Some(&json!(0)));
    assert_eq!(sentinel.get("totalRaised"), Some(&json!(5.0)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
