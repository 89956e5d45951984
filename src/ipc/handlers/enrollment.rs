use crate::enrollment::{self, EnrollmentSyncOutcome};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_params, require_in_tenant, today};
use crate::ipc::types::{AppState, Request};
use crate::model::{ENROLLMENT_AUXILIARY, ENROLLMENT_PRIMARY};
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

fn outcome_json(outcome: &EnrollmentSyncOutcome) -> serde_json::Value {
    json!({
        "updatedCount": outcome.updated_count,
        "createdCount": outcome.created_count,
        "prunedCount": outcome.pruned_count,
        "logs": outcome.logs,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignParams {
    tenant_id: String,
    student_id: String,
    class_id: String,
    school_year_id: String,
    #[serde(default)]
    kind: Option<String>,
}

fn handle_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: AssignParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let kind = params
        .kind
        .as_deref()
        .unwrap_or(ENROLLMENT_PRIMARY)
        .to_string();
    if kind != ENROLLMENT_PRIMARY && kind != ENROLLMENT_AUXILIARY {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: primary, auxiliary",
            Some(json!({ "kind": kind })),
        );
    }
    if let Err(e) = require_in_tenant(
        conn,
        "students",
        "student",
        &params.student_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }
    if let Err(e) = require_in_tenant(conn, "classes", "class", &params.class_id, &params.tenant_id)
    {
        return e.response(&req.id);
    }

    let duplicate: Option<String> = match conn
        .query_row(
            "SELECT id FROM student_enrollments
             WHERE tenant_id = ?1 AND student_id = ?2 AND class_id = ?3 AND school_year_id = ?4",
            (
                &params.tenant_id,
                &params.student_id,
                &params.class_id,
                &params.school_year_id,
            ),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "conflict",
            "student is already enrolled in this class",
            Some(json!({ "classId": params.class_id })),
        );
    }

    if kind == ENROLLMENT_PRIMARY {
        let existing_primary: Option<String> = match conn
            .query_row(
                "SELECT id FROM student_enrollments
                 WHERE tenant_id = ?1 AND student_id = ?2 AND school_year_id = ?3
                   AND kind = 'primary'",
                (&params.tenant_id, &params.student_id, &params.school_year_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if existing_primary.is_some() {
            return err(
                &req.id,
                "conflict",
                "student already has a primary enrollment for this school year; use enrollment.move",
                Some(json!({ "schoolYearId": params.school_year_id })),
            );
        }
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO student_enrollments(
            id, tenant_id, student_id, class_id, school_year_id, kind)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (
            &enrollment_id,
            &params.tenant_id,
            &params.student_id,
            &params.class_id,
            &params.school_year_id,
            &kind,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "student_enrollments" })),
        );
    }

    // A first primary assignment counts as a class change: align the
    // subject records immediately. Auxiliary enrollments never drive
    // records; those follow the primary class.
    let outcome = if kind == ENROLLMENT_PRIMARY {
        match enrollment::sync_student_subjects(
            conn,
            &params.tenant_id,
            &params.student_id,
            &params.class_id,
            &params.school_year_id,
            None,
            today(),
        ) {
            Ok(o) => o,
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        }
    } else {
        let mut outcome = EnrollmentSyncOutcome::default();
        outcome
            .logs
            .push("auxiliary enrollment does not drive subject records".to_string());
        outcome
    };

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "kind": kind,
            "recordsSync": outcome_json(&outcome),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveParams {
    tenant_id: String,
    student_id: String,
    new_class_id: String,
    school_year_id: String,
}

fn handle_move(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: MoveParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Err(e) = require_in_tenant(
        conn,
        "classes",
        "class",
        &params.new_class_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, class_id FROM student_enrollments
         WHERE tenant_id = ?1 AND student_id = ?2 AND school_year_id = ?3 AND kind = 'primary'
         ORDER BY rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let primaries: Vec<(String, String)> = match stmt
        .query_map(
            (&params.tenant_id, &params.student_id, &params.school_year_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .and_then(|it| it.collect())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(stmt);

    let Some((enrollment_id, old_class_id)) = primaries.first().cloned() else {
        return err(
            &req.id,
            "not_found",
            "student has no primary enrollment for this school year",
            None,
        );
    };

    // An auxiliary enrollment in the target class would collide with the
    // moved row. Surplus primary rows there do not count; they are
    // collapsed below.
    if old_class_id != params.new_class_id {
        let collision: Option<String> = match conn
            .query_row(
                "SELECT id FROM student_enrollments
                 WHERE tenant_id = ?1 AND student_id = ?2 AND class_id = ?3
                   AND school_year_id = ?4 AND kind != 'primary'",
                (
                    &params.tenant_id,
                    &params.student_id,
                    &params.new_class_id,
                    &params.school_year_id,
                ),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if collision.is_some() {
            return err(
                &req.id,
                "conflict",
                "student already has an enrollment in the target class",
                Some(json!({ "classId": params.new_class_id })),
            );
        }
    }

    // A move edits the primary row in place; it never inserts a second one.
    // Surplus primaries are a data-integrity defect and collapse to the
    // kept row.
    let collapsed = primaries.len().saturating_sub(1);
    {
        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        for (surplus_id, _) in primaries.iter().skip(1) {
            if let Err(e) = tx.execute(
                "DELETE FROM student_enrollments WHERE id = ?1",
                [surplus_id],
            ) {
                return err(&req.id, "db_delete_failed", e.to_string(), None);
            }
        }
        if let Err(e) = tx.execute(
            "UPDATE student_enrollments SET class_id = ?1 WHERE id = ?2",
            (&params.new_class_id, &enrollment_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_commit_failed", e.to_string(), None);
        }
    }

    let old_for_sync = if old_class_id == params.new_class_id {
        None
    } else {
        Some(old_class_id.as_str())
    };
    let outcome = match enrollment::sync_student_subjects(
        conn,
        &params.tenant_id,
        &params.student_id,
        &params.new_class_id,
        &params.school_year_id,
        old_for_sync,
        today(),
    ) {
        Ok(o) => o,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "oldClassId": old_class_id,
            "newClassId": params.new_class_id,
            "collapsedPrimaries": collapsed,
            "recordsSync": outcome_json(&outcome),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnassignParams {
    tenant_id: String,
    enrollment_id: String,
}

fn handle_unassign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: UnassignParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let row: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT student_id, class_id, school_year_id FROM student_enrollments
             WHERE id = ?1 AND tenant_id = ?2",
            (&params.enrollment_id, &params.tenant_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((student_id, class_id, school_year_id)) = row else {
        return err(&req.id, "not_found", "enrollment not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM student_enrollments WHERE id = ?1",
        [&params.enrollment_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    // Leaving the class retires its subject records too.
    let records_deleted = match tx.execute(
        "DELETE FROM student_subject_records
         WHERE tenant_id = ?1 AND student_id = ?2 AND class_id = ?3 AND school_year_id = ?4",
        (&params.tenant_id, &student_id, &class_id, &school_year_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "removed": true,
            "recordsDeleted": records_deleted,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.assign" => Some(handle_assign(state, req)),
        "enrollment.move" => Some(handle_move(state, req)),
        "enrollment.unassign" => Some(handle_unassign(state, req)),
        _ => None,
    }
}
