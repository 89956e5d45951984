use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_date_param, parse_params, require_in_tenant};
use crate::ipc::types::{AppState, Request};
use crate::model;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceParams {
    tenant_id: String,
    class_id: String,
    start_date: String,
    end_date: String,
}

fn handle_create_instance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreateInstanceParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Err(e) = require_in_tenant(conn, "classes", "class", &params.class_id, &params.tenant_id)
    {
        return e.response(&req.id);
    }
    let start = match parse_date_param(&params.start_date, "startDate") {
        Ok(d) => d,
        Err(e) => return e.response(&req.id),
    };
    let end = match parse_date_param(&params.end_date, "endDate") {
        Ok(d) => d,
        Err(e) => return e.response(&req.id),
    };
    if end < start {
        return err(
            &req.id,
            "bad_params",
            "endDate must be on or after startDate",
            None,
        );
    }

    let instance_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO timetable_instances(id, tenant_id, class_id, start_date, end_date)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (
            &instance_id,
            &params.tenant_id,
            &params.class_id,
            &params.start_date,
            &params.end_date,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "timetable_instances" })),
        );
    }
    ok(&req.id, json!({ "instanceId": instance_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRowParams {
    tenant_id: String,
    instance_id: String,
    day_of_week: String,
    period_id: String,
    subject_id: String,
    #[serde(default)]
    teacher_1_id: Option<String>,
    #[serde(default)]
    teacher_2_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

fn handle_add_row(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: AddRowParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Err(e) = require_in_tenant(
        conn,
        "timetable_instances",
        "timetable instance",
        &params.instance_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }
    if !model::is_day_code(&params.day_of_week) {
        return err(
            &req.id,
            "bad_params",
            "dayOfWeek must be one of: mon..sun",
            Some(json!({ "dayOfWeek": params.day_of_week })),
        );
    }
    if let Err(e) = require_in_tenant(
        conn,
        "subjects",
        "subject",
        &params.subject_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }
    for teacher in [params.teacher_1_id.as_deref(), params.teacher_2_id.as_deref()]
        .into_iter()
        .flatten()
    {
        if let Err(e) = require_in_tenant(conn, "teachers", "teacher", teacher, &params.tenant_id) {
            return e.response(&req.id);
        }
    }

    let row_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO timetable_rows(
            id, instance_id, day_of_week, period_id, subject_id,
            teacher_1_id, teacher_2_id, room_id)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            &row_id,
            &params.instance_id,
            &params.day_of_week,
            &params.period_id,
            &params.subject_id,
            &params.teacher_1_id,
            &params.teacher_2_id,
            &params.room_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "timetable_rows" })),
        );
    }
    ok(&req.id, json!({ "rowId": row_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRowsParams {
    tenant_id: String,
    instance_id: String,
}

fn handle_list_rows(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: ListRowsParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = require_in_tenant(
        conn,
        "timetable_instances",
        "timetable instance",
        &params.instance_id,
        &params.tenant_id,
    ) {
        return e.response(&req.id);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, day_of_week, period_id, subject_id, teacher_1_id, teacher_2_id, room_id
         FROM timetable_rows
         WHERE instance_id = ?1
         ORDER BY day_of_week, period_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&params.instance_id], |row| {
            Ok(json!({
                "rowId": row.get::<_, String>(0)?,
                "dayOfWeek": row.get::<_, String>(1)?,
                "periodId": row.get::<_, String>(2)?,
                "subjectId": row.get::<_, String>(3)?,
                "teacher1Id": row.get::<_, Option<String>>(4)?,
                "teacher2Id": row.get::<_, Option<String>>(5)?,
                "roomId": row.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => ok(&req.id, json!({ "rows": rows })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListScheduleParams {
    tenant_id: String,
    teacher_id: String,
    #[serde(default)]
    from_date: Option<String>,
    #[serde(default)]
    to_date: Option<String>,
}

fn handle_list_schedule(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: ListScheduleParams = match parse_params(req) {
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

    let from = params.from_date.unwrap_or_else(|| "0000-01-01".to_string());
    let to = params.to_date.unwrap_or_else(|| "9999-12-31".to_string());

    let mut stmt = match conn.prepare(
        "SELECT class_id, date, day_of_week, period_id, subject_id, room_id, instance_id
         FROM teacher_schedule
         WHERE tenant_id = ?1 AND teacher_id = ?2 AND date >= ?3 AND date <= ?4
         ORDER BY date, period_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(
            (&params.tenant_id, &params.teacher_id, &from, &to),
            |row| {
                Ok(json!({
                    "classId": row.get::<_, String>(0)?,
                    "date": row.get::<_, String>(1)?,
                    "dayOfWeek": row.get::<_, String>(2)?,
                    "periodId": row.get::<_, String>(3)?,
                    "subjectId": row.get::<_, String>(4)?,
                    "roomId": row.get::<_, Option<String>>(5)?,
                    "instanceId": row.get::<_, String>(6)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.createInstance" => Some(handle_create_instance(state, req)),
        "timetable.addRow" => Some(handle_add_row(state, req)),
        "timetable.listRows" => Some(handle_list_rows(state, req)),
        "schedule.list" => Some(handle_list_schedule(state, req)),
        _ => None,
    }
}
