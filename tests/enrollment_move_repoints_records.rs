use serde_json::{json, Value};
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
    let exe = env!("CARGO_BIN_EXE_schedsyncd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schedsyncd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
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
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn i64_field(v: &Value, key: &str) -> i64 {
    v.get(key)
        .and_then(|x| x.as_i64())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
}

const TENANT: &str = "campus-west";
const YEAR: &str = "sy-2098";

/// Builds a class with one timetable row per given subject id.
fn build_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id_prefix: &str,
    name: &str,
    subject_ids: &[&str],
) -> String {
    let class = request_ok(
        stdin,
        reader,
        &format!("{}c", id_prefix),
        "catalog.createClass",
        json!({ "tenantId": TENANT, "name": name, "schoolYearId": YEAR }),
    );
    let class_id = str_field(&class, "classId");
    let instance = request_ok(
        stdin,
        reader,
        &format!("{}i", id_prefix),
        "timetable.createInstance",
        json!({
            "tenantId": TENANT,
            "classId": class_id,
            "startDate": "2098-02-01",
            "endDate": "2098-06-30"
        }),
    );
    let instance_id = str_field(&instance, "instanceId");
    let days = ["mon", "tue", "wed", "thu", "fri", "sat"];
    for (i, subject_id) in subject_ids.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("{}r{}", id_prefix, i),
            "timetable.addRow",
            json!({
                "tenantId": TENANT,
                "instanceId": instance_id,
                "dayOfWeek": days[i % days.len()],
                "periodId": format!("p{}", i + 1),
                "subjectId": subject_id
            }),
        );
    }
    class_id
}

/// A mid-year move: five subjects in the old class, six in the new one
/// with four shared. After the move the student carries exactly the new
/// roster and the counts reconcile.
#[test]
fn mid_year_class_move_reconciles_subject_records() {
    let workspace = temp_dir("schedsync-move");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "catalog.createStudent",
        json!({ "tenantId": TENANT, "fullName": "Linh Truong" }),
    );
    let student_id = str_field(&student, "studentId");

    // Seven graded subjects, each with a mapped timetable subject.
    let mut subject_ids = Vec::new();
    for i in 0..7 {
        let canonical = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s3-{}", i),
            "catalog.createCanonicalSubject",
            json!({ "tenantId": TENANT, "name": format!("Subject {}", i) }),
        );
        let canonical_id = str_field(&canonical, "canonicalSubjectId");
        let subject = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s4-{}", i),
            "catalog.createSubject",
            json!({
                "tenantId": TENANT,
                "name": format!("TT Subject {}", i),
                "canonicalSubjectId": canonical_id
            }),
        );
        subject_ids.push(str_field(&subject, "subjectId"));
    }

    // Class A teaches subjects 0..5; class B teaches 1..7 (four shared:
    // 1, 2, 3, 4).
    let a_subjects: Vec<&str> = subject_ids[0..5].iter().map(|s| s.as_str()).collect();
    let b_subjects: Vec<&str> = subject_ids[1..7].iter().map(|s| s.as_str()).collect();
    let class_a = build_class(&mut stdin, &mut reader, "a", "7A", &a_subjects);
    let class_b = build_class(&mut stdin, &mut reader, "b", "7B", &b_subjects);

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "enrollment.assign",
        json!({
            "tenantId": TENANT,
            "studentId": student_id,
            "classId": class_a,
            "schoolYearId": YEAR,
            "kind": "primary"
        }),
    );
    let records = assigned.get("recordsSync").expect("recordsSync");
    assert_eq!(i64_field(records, "createdCount"), 5);
    assert_eq!(i64_field(records, "updatedCount"), 0);

    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.move",
        json!({
            "tenantId": TENANT,
            "studentId": student_id,
            "newClassId": class_b,
            "schoolYearId": YEAR
        }),
    );
    assert_eq!(
        moved.get("oldClassId").and_then(|v| v.as_str()),
        Some(class_a.as_str())
    );
    let records = moved.get("recordsSync").expect("recordsSync");
    // Four shared subjects follow the student, two new ones are created,
    // the one only class A taught is pruned: 4 + 2 = the new roster of 6.
    assert_eq!(i64_field(records, "updatedCount"), 4);
    assert_eq!(i64_field(records, "createdCount"), 2);
    assert_eq!(i64_field(records, "prunedCount"), 1);

    // Nothing still points at class A, and class B is fully consistent.
    let status = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sync.checkStatus",
        json!({ "tenantId": TENANT, "classIds": [class_b] }),
    );
    let classes = status.get("classes").and_then(|v| v.as_array()).expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(i64_field(&classes[0], "studentsChecked"), 1);
    assert_eq!(i64_field(&classes[0], "studentsWithIssues"), 0);
}
