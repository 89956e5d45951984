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

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

const TENANT: &str = "campus-west";
const YEAR: &str = "sy-2098";

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
    let days = ["mon", "tue", "wed"];
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

#[test]
fn one_primary_enrollment_per_student_and_year() {
    let workspace = temp_dir("schedsync-primary");
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
        json!({ "tenantId": TENANT, "fullName": "Huy Le" }),
    );
    let student_id = str_field(&student, "studentId");

    let canonical = request_ok(
        &mut stdin,
        &mut reader,
        "s3",
        "catalog.createCanonicalSubject",
        json!({ "tenantId": TENANT, "name": "Literature" }),
    );
    let canonical_id = str_field(&canonical, "canonicalSubjectId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "s4",
        "catalog.createSubject",
        json!({ "tenantId": TENANT, "name": "Lit", "canonicalSubjectId": canonical_id }),
    );
    let subject_id = str_field(&subject, "subjectId");
    let subjects = [subject_id.as_str()];

    let class_a = build_class(&mut stdin, &mut reader, "a", "7A", &subjects);
    let class_b = build_class(&mut stdin, &mut reader, "b", "7B", &subjects);
    let class_c = build_class(&mut stdin, &mut reader, "c", "7C", &subjects);

    // First primary is fine; a second primary for the same year is not an
    // add, it is a move.
    let _ = request_ok(
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
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.assign",
        json!({
            "tenantId": TENANT,
            "studentId": student_id,
            "classId": class_b,
            "schoolYearId": YEAR,
            "kind": "primary"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("conflict"));

    // Auxiliary enrollments are unbounded and never touch the records.
    let aux = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enrollment.assign",
        json!({
            "tenantId": TENANT,
            "studentId": student_id,
            "classId": class_b,
            "schoolYearId": YEAR,
            "kind": "auxiliary"
        }),
    );
    let aux_id = str_field(&aux, "enrollmentId");
    let records = aux.get("recordsSync").expect("recordsSync");
    assert_eq!(records.get("createdCount").and_then(|v| v.as_i64()), Some(0));

    // Moving into a class that already holds an auxiliary enrollment is a
    // conflict the caller must resolve first.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.move",
        json!({
            "tenantId": TENANT,
            "studentId": student_id,
            "newClassId": class_b,
            "schoolYearId": YEAR
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("conflict"));

    // A clean move edits the primary row in place.
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollment.move",
        json!({
            "tenantId": TENANT,
            "studentId": student_id,
            "newClassId": class_c,
            "schoolYearId": YEAR
        }),
    );
    assert_eq!(
        moved.get("collapsedPrimaries").and_then(|v| v.as_i64()),
        Some(0)
    );
    assert_eq!(
        moved.get("oldClassId").and_then(|v| v.as_str()),
        Some(class_a.as_str())
    );

    // After the aux enrollment is released, moving there works.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "enrollment.unassign",
        json!({ "tenantId": TENANT, "enrollmentId": aux_id }),
    );
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
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
        Some(class_c.as_str())
    );
}

#[test]
fn surplus_primary_rows_collapse_on_move() {
    let workspace = temp_dir("schedsync-collapse");
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
        json!({ "tenantId": TENANT, "fullName": "Nga Vo" }),
    );
    let student_id = str_field(&student, "studentId");
    let canonical = request_ok(
        &mut stdin,
        &mut reader,
        "s3",
        "catalog.createCanonicalSubject",
        json!({ "tenantId": TENANT, "name": "Music" }),
    );
    let canonical_id = str_field(&canonical, "canonicalSubjectId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "s4",
        "catalog.createSubject",
        json!({ "tenantId": TENANT, "name": "Music", "canonicalSubjectId": canonical_id }),
    );
    let subject_id = str_field(&subject, "subjectId");
    let subjects = [subject_id.as_str()];
    let class_a = build_class(&mut stdin, &mut reader, "a", "3A", &subjects);
    let class_b = build_class(&mut stdin, &mut reader, "b", "3B", &subjects);

    let _ = request_ok(
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

    // Simulate the data-integrity defect the engine must tolerate: a
    // second primary row snuck into the store behind the API's back.
    {
        let db = rusqlite::Connection::open(workspace.join("schedsync.sqlite3"))
            .expect("open workspace db");
        db.execute(
            "INSERT INTO student_enrollments(
                id, tenant_id, student_id, class_id, school_year_id, kind)
             VALUES('rogue-primary', ?1, ?2, ?3, ?4, 'primary')",
            (TENANT, &student_id, &class_b, YEAR),
        )
        .expect("inject surplus primary");
    }

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
        moved.get("collapsedPrimaries").and_then(|v| v.as_i64()),
        Some(1),
        "the surplus primary row must be collapsed, not kept"
    );

    // Exactly one primary row remains.
    let db = rusqlite::Connection::open(workspace.join("schedsync.sqlite3"))
        .expect("open workspace db");
    let primaries: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM student_enrollments
             WHERE student_id = ?1 AND school_year_id = ?2 AND kind = 'primary'",
            (&student_id, YEAR),
            |r| r.get(0),
        )
        .expect("count primaries");
    assert_eq!(primaries, 1);
}
