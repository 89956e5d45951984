use crate::enrollment;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_params, require_in_tenant, today};
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckStatusParams {
    tenant_id: String,
    class_ids: Vec<String>,
}

fn handle_check_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CheckStatusParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if params.class_ids.is_empty() {
        return err(&req.id, "bad_params", "classIds must not be empty", None);
    }
    for class_id in &params.class_ids {
        if let Err(e) = require_in_tenant(conn, "classes", "class", class_id, &params.tenant_id) {
            return e.response(&req.id);
        }
    }

    let today = today();
    let mut classes = Vec::new();
    for class_id in &params.class_ids {
        let (statuses, warnings) =
            match enrollment::check_class_status(conn, &params.tenant_id, class_id, today) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };

        let students_checked = statuses.len();
        let students: Vec<serde_json::Value> = statuses
            .iter()
            .filter(|s| !s.is_clean())
            .map(|s| {
                json!({
                    "studentId": s.student_id,
                    "schoolYearId": s.school_year_id,
                    "mismatchedRecords": s.mismatched_subjects.len(),
                    "mismatchedSubjects": s.mismatched_subjects,
                    "missingSubjects": s.missing_subjects,
                    "extraneousSubjects": s.extraneous_subjects,
                })
            })
            .collect();

        classes.push(json!({
            "classId": class_id,
            "studentsChecked": students_checked,
            "studentsWithIssues": students.len(),
            "students": students,
            "rosterWarnings": warnings,
        }));
    }

    ok(&req.id, json!({ "classes": classes }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceResyncParams {
    tenant_id: String,
    class_ids: Vec<String>,
    #[serde(default)]
    auto_fix: bool,
}

fn handle_force_resync(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: ForceResyncParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if params.class_ids.is_empty() {
        return err(&req.id, "bad_params", "classIds must not be empty", None);
    }
    for class_id in &params.class_ids {
        if let Err(e) = require_in_tenant(conn, "classes", "class", class_id, &params.tenant_id) {
            return e.response(&req.id);
        }
    }

    let today = today();

    if !params.auto_fix {
        // Dry run: report what a fix pass would do, write nothing.
        let mut would_repoint = 0i64;
        let mut would_create = 0i64;
        let mut would_prune = 0i64;
        let mut students_with_issues = 0i64;
        for class_id in &params.class_ids {
            let (statuses, _) =
                match enrollment::check_class_status(conn, &params.tenant_id, class_id, today) {
                    Ok(v) => v,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
            for status in statuses {
                if status.is_clean() {
                    continue;
                }
                students_with_issues += 1;
                // A mismatched record whose subject the class still
                // teaches gets re-pointed; one it does not gets pruned.
                // Creations only cover the rest of the missing roster.
                for subject in &status.mismatched_subjects {
                    if status.missing_subjects.contains(subject) {
                        would_repoint += 1;
                    } else {
                        would_prune += 1;
                    }
                }
                would_create += status
                    .missing_subjects
                    .iter()
                    .filter(|s| !status.mismatched_subjects.contains(*s))
                    .count() as i64;
                would_prune += status.extraneous_subjects.len() as i64;
            }
        }
        return ok(
            &req.id,
            json!({
                "applied": false,
                "studentsWithIssues": students_with_issues,
                "wouldRepoint": would_repoint,
                "wouldCreate": would_create,
                "wouldPrune": would_prune,
            }),
        );
    }

    // Fix pass: realign every primary-enrolled student, collecting per-item
    // failures instead of aborting the walk.
    let mut students_processed = 0i64;
    let mut updated_count = 0i64;
    let mut created_count = 0i64;
    let mut pruned_count = 0i64;
    let mut logs: Vec<String> = Vec::new();

    for class_id in &params.class_ids {
        let enrolled: Vec<(String, String)> = {
            let mut stmt = match conn.prepare(
                "SELECT student_id, school_year_id FROM student_enrollments
                 WHERE tenant_id = ?1 AND class_id = ?2 AND kind = 'primary'
                 ORDER BY student_id",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            match stmt
                .query_map((&params.tenant_id, class_id), |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })
                .and_then(|it| it.collect())
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        };

        for (student_id, school_year_id) in enrolled {
            match enrollment::sync_student_subjects(
                conn,
                &params.tenant_id,
                &student_id,
                class_id,
                &school_year_id,
                None,
                today,
            ) {
                Ok(outcome) => {
                    students_processed += 1;
                    updated_count += outcome.updated_count;
                    created_count += outcome.created_count;
                    pruned_count += outcome.pruned_count;
                    logs.extend(outcome.logs);
                }
                Err(e) => {
                    logs.push(format!("student {}: resync failed: {}", student_id, e));
                }
            }
        }
    }

    ok(
        &req.id,
        json!({
            "applied": true,
            "studentsProcessed": students_processed,
            "updatedCount": updated_count,
            "createdCount": created_count,
            "prunedCount": pruned_count,
            "logs": logs,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sync.checkStatus" => Some(handle_check_status(state, req)),
        "sync.forceResync" => Some(handle_force_resync(state, req)),
        _ => None,
    }
}
