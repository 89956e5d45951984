use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_params, require_in_tenant, today, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{Validity, ValidityMode, ValiditySpec};
use crate::sync::{self, SyncReport, SyncScope};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

fn report_json(report: &SyncReport) -> serde_json::Value {
    let schedule = report.schedule.as_ref().map(|s| {
        json!({
            "created": s.created,
            "updated": s.updated,
            "errors": s.errors,
        })
    });
    json!({
        "rowsUpdated": report.rows_updated,
        "rowsSkipped": report.rows_skipped,
        "instancesChecked": report.instances_checked,
        "logs": report.logs,
        "schedule": schedule,
    })
}

/// Resolves a caller-supplied subject id to the graded catalog. A timetable
/// subject id with a canonical link is auto-corrected instead of rejected;
/// one without a link is a validation error.
fn resolve_subject(
    conn: &Connection,
    tenant_id: &str,
    subject_id: &str,
) -> Result<(String, Option<String>), HandlerErr> {
    let canonical: Option<String> = conn
        .query_row(
            "SELECT id FROM canonical_subjects WHERE id = ?1 AND tenant_id = ?2",
            (subject_id, tenant_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = canonical {
        return Ok((id, None));
    }

    let aliased: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, canonical_subject_id FROM subjects WHERE id = ?1 AND tenant_id = ?2",
            (subject_id, tenant_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match aliased {
        Some((_, Some(canonical))) => Ok((
            canonical.clone(),
            Some(format!(
                "subject {} resolved to canonical subject {}",
                subject_id, canonical
            )),
        )),
        Some((_, None)) => Err(HandlerErr::with_details(
            "bad_params",
            "subject has no canonical mapping",
            json!({ "subjectId": subject_id }),
        )),
        None => Err(HandlerErr::with_details(
            "not_found",
            "subject not found",
            json!({ "subjectId": subject_id }),
        )),
    }
}

/// Sync horizon: today, lowered to the earliest from_date start when a
/// delta narrows retroactively.
fn horizon_for<'a>(validities: impl Iterator<Item = &'a Validity>) -> NaiveDate {
    let mut horizon = today();
    for v in validities {
        if v.mode == ValidityMode::FromDate {
            if let Some(start) = v.start_date {
                if start < horizon {
                    horizon = start;
                }
            }
        }
    }
    horizon
}

fn find_assignment(
    conn: &Connection,
    tenant_id: &str,
    teacher_id: &str,
    class_id: Option<&str>,
    subject_id: &str,
) -> Result<Option<String>, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM teacher_assignments
             WHERE tenant_id = ?1 AND teacher_id = ?2 AND subject_id = ?3 AND class_id IS ?4",
            (tenant_id, teacher_id, subject_id, class_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrUpdateParams {
    tenant_id: String,
    teacher_id: String,
    #[serde(default)]
    class_id: Option<String>,
    subject_id: String,
    validity: ValiditySpec,
}

fn handle_create_or_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreateOrUpdateParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let validity = match params.validity.resolve() {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if let Err(e) = require_in_tenant(
        conn,
        "teachers",
        "teacher",
        &params.teacher_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }
    if let Some(class_id) = params.class_id.as_deref() {
        if let Err(e) = require_in_tenant(conn, "classes", "class", class_id, &params.tenant_id) {
            return e.response(&req.id);
        }
    }
    let (subject_id, correction) = match resolve_subject(conn, &params.tenant_id, &params.subject_id)
    {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let existing = match find_assignment(
        conn,
        &params.tenant_id,
        &params.teacher_id,
        params.class_id.as_deref(),
        &subject_id,
    ) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let (assignment_id, created) = match existing {
        Some(id) => {
            // Same (teacher, class, subject) tuple: this is an edit of the
            // validity window, never a second record.
            if let Err(e) = conn.execute(
                "UPDATE teacher_assignments
                 SET validity_mode = ?1, start_date = ?2, end_date = ?3
                 WHERE id = ?4",
                (
                    validity.mode.as_str(),
                    validity.start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    validity.end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    &id,
                ),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            (id, false)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO teacher_assignments(
                    id, tenant_id, teacher_id, class_id, subject_id,
                    validity_mode, start_date, end_date)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                (
                    &id,
                    &params.tenant_id,
                    &params.teacher_id,
                    &params.class_id,
                    &subject_id,
                    validity.mode.as_str(),
                    validity.start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    validity.end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "teacher_assignments" })),
                );
            }
            (id, true)
        }
    };

    let scope = SyncScope {
        class_ids: params.class_id.clone().into_iter().collect(),
        subject_ids: vec![subject_id],
        horizon: horizon_for(std::iter::once(&validity)),
    };
    let mut report = match sync::sync_teacher_scope(conn, &params.tenant_id, &params.teacher_id, &scope)
    {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Some(log) = correction {
        report.logs.insert(0, log);
    }

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "created": created,
            "sync": report_json(&report),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
    tenant_id: String,
    assignment_id: String,
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: DeleteParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let row: Option<(String, Option<String>, String)> = match conn
        .query_row(
            "SELECT teacher_id, class_id, subject_id FROM teacher_assignments
             WHERE id = ?1 AND tenant_id = ?2",
            (&params.assignment_id, &params.tenant_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((teacher_id, class_id, subject_id)) = row else {
        return err(&req.id, "not_found", "assignment not found", None);
    };

    if let Err(e) = conn.execute(
        "DELETE FROM teacher_assignments WHERE id = ?1",
        [&params.assignment_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    // No delta start date to narrow to: sync from today forward.
    let scope = SyncScope {
        class_ids: class_id.into_iter().collect(),
        subject_ids: vec![subject_id],
        horizon: today(),
    };
    let report = match sync::sync_teacher_scope(conn, &params.tenant_id, &teacher_id, &scope) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "deleted": true,
            "sync": report_json(&report),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchItem {
    class_id: String,
    subject_ids: Vec<String>,
    validity: ValiditySpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchReplaceParams {
    tenant_id: String,
    teacher_id: String,
    #[serde(default)]
    items: Vec<BatchItem>,
    #[serde(default)]
    deleted_ids: Vec<String>,
}

/// Bulk edit of one teacher's assignments. Repository writes happen first,
/// all-or-nothing; the union of affected classes and subjects is then
/// synced in exactly one engine pass, so the sync cost scales with the
/// distinct (class, subject) pairs touched, not with the item count.
fn handle_batch_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: BatchReplaceParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Err(e) = require_in_tenant(
        conn,
        "teachers",
        "teacher",
        &params.teacher_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }

    // Validate everything before writing anything.
    let mut errors: Vec<String> = Vec::new();
    let mut correction_logs: Vec<String> = Vec::new();
    // (class_id, canonical_subject_id, validity) per pair to apply.
    let mut pairs: Vec<(String, String, Validity)> = Vec::new();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

    for (idx, item) in params.items.iter().enumerate() {
        let validity = match item.validity.resolve() {
            Ok(v) => v,
            Err(msg) => {
                errors.push(format!("item {}: {}", idx, msg));
                continue;
            }
        };
        match require_in_tenant(conn, "classes", "class", &item.class_id, &params.tenant_id) {
            Ok(()) => {}
            Err(e) => {
                errors.push(format!("item {}: {}", idx, e.message));
                continue;
            }
        }
        if item.subject_ids.is_empty() {
            errors.push(format!("item {}: subjectIds must not be empty", idx));
            continue;
        }
        for subject_id in &item.subject_ids {
            match resolve_subject(conn, &params.tenant_id, subject_id) {
                Ok((canonical, correction)) => {
                    if let Some(log) = correction {
                        correction_logs.push(log);
                    }
                    let key = (item.class_id.clone(), canonical.clone());
                    if !seen.insert(key) {
                        errors.push(format!(
                            "item {}: duplicate assignment for class {} subject {}",
                            idx, item.class_id, subject_id
                        ));
                        continue;
                    }
                    pairs.push((item.class_id.clone(), canonical, validity.clone()));
                }
                Err(e) => errors.push(format!("item {}: {}", idx, e.message)),
            }
        }
    }

    // Deletions are diffed against prior state and must belong to this
    // teacher.
    let mut deletions: Vec<(String, Option<String>, String)> = Vec::new();
    for deleted_id in &params.deleted_ids {
        let row: Option<(String, Option<String>, String)> = match conn
            .query_row(
                "SELECT teacher_id, class_id, subject_id FROM teacher_assignments
                 WHERE id = ?1 AND tenant_id = ?2",
                (deleted_id, &params.tenant_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match row {
            Some((teacher_id, class_id, subject_id)) if teacher_id == params.teacher_id => {
                deletions.push((deleted_id.clone(), class_id, subject_id));
            }
            Some(_) => errors.push(format!(
                "deletedIds: assignment {} belongs to another teacher",
                deleted_id
            )),
            None => errors.push(format!("deletedIds: assignment {} not found", deleted_id)),
        }
    }

    if !errors.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "batch validation failed",
            Some(json!({ "errors": errors })),
        );
    }

    // Apply phase: all-or-nothing.
    let mut created_count = 0i64;
    let mut updated_count = 0i64;
    let mut deleted_count = 0i64;
    let mut class_scope: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut subject_scope: std::collections::HashSet<String> = std::collections::HashSet::new();

    let mut apply = || -> Result<(), HandlerErr> {
        let tx = conn.unchecked_transaction()?;
        for (deleted_id, class_id, subject_id) in &deletions {
            tx.execute("DELETE FROM teacher_assignments WHERE id = ?1", [deleted_id])?;
            deleted_count += 1;
            if let Some(class_id) = class_id {
                class_scope.insert(class_id.clone());
            }
            subject_scope.insert(subject_id.clone());
        }
        for (class_id, subject_id, validity) in &pairs {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM teacher_assignments
                     WHERE tenant_id = ?1 AND teacher_id = ?2 AND subject_id = ?3
                       AND class_id IS ?4",
                    (&params.tenant_id, &params.teacher_id, subject_id, class_id),
                    |r| r.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE teacher_assignments
                         SET validity_mode = ?1, start_date = ?2, end_date = ?3
                         WHERE id = ?4",
                        (
                            validity.mode.as_str(),
                            validity.start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                            validity.end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                            &id,
                        ),
                    )?;
                    updated_count += 1;
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO teacher_assignments(
                            id, tenant_id, teacher_id, class_id, subject_id,
                            validity_mode, start_date, end_date)
                         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        (
                            &id,
                            &params.tenant_id,
                            &params.teacher_id,
                            class_id,
                            subject_id,
                            validity.mode.as_str(),
                            validity.start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                            validity.end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                        ),
                    )?;
                    created_count += 1;
                }
            }
            class_scope.insert(class_id.clone());
            subject_scope.insert(subject_id.clone());
        }
        tx.commit()?;
        Ok(())
    };
    if let Err(e) = apply() {
        return err(&req.id, "db_tx_failed", e.message, e.details);
    }

    // One sync pass for the whole union.
    let scope = SyncScope {
        class_ids: class_scope.into_iter().collect(),
        subject_ids: subject_scope.into_iter().collect(),
        horizon: horizon_for(pairs.iter().map(|(_, _, v)| v)),
    };
    let mut report = match sync::sync_teacher_scope(conn, &params.tenant_id, &params.teacher_id, &scope)
    {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    for log in correction_logs.into_iter().rev() {
        report.logs.insert(0, log);
    }

    ok(
        &req.id,
        json!({
            "createdCount": created_count,
            "updatedCount": updated_count,
            "deletedCount": deleted_count,
            "sync": report_json(&report),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    tenant_id: String,
    teacher_id: String,
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: ListParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = require_in_tenant(
        conn,
        "teachers",
        "teacher",
        &params.teacher_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, class_id, subject_id, validity_mode, start_date, end_date
         FROM teacher_assignments
         WHERE tenant_id = ?1 AND teacher_id = ?2
         ORDER BY class_id, subject_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&params.tenant_id, &params.teacher_id), |row| {
            Ok(json!({
                "assignmentId": row.get::<_, String>(0)?,
                "classId": row.get::<_, Option<String>>(1)?,
                "subjectId": row.get::<_, String>(2)?,
                "validity": {
                    "mode": row.get::<_, String>(3)?,
                    "startDate": row.get::<_, Option<String>>(4)?,
                    "endDate": row.get::<_, Option<String>>(5)?,
                },
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.createOrUpdate" => Some(handle_create_or_update(state, req)),
        "assignments.delete" => Some(handle_delete(state, req)),
        "assignments.batchReplace" => Some(handle_batch_replace(state, req)),
        "assignments.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
