use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_params, require_in_tenant};
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateClassParams {
    tenant_id: String,
    name: String,
    #[serde(default)]
    school_year_id: Option<String>,
}

fn handle_create_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreateClassParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if params.name.trim().is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, tenant_id, name, school_year_id) VALUES(?1, ?2, ?3, ?4)",
        (
            &class_id,
            &params.tenant_id,
            params.name.trim(),
            &params.school_year_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    ok(&req.id, json!({ "classId": class_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCanonicalSubjectParams {
    tenant_id: String,
    name: String,
}

fn handle_create_canonical_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreateCanonicalSubjectParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO canonical_subjects(id, tenant_id, name) VALUES(?1, ?2, ?3)",
        (&subject_id, &params.tenant_id, params.name.trim()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "canonical_subjects" })),
        );
    }
    ok(&req.id, json!({ "canonicalSubjectId": subject_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubjectParams {
    tenant_id: String,
    name: String,
    #[serde(default)]
    canonical_subject_id: Option<String>,
}

fn handle_create_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreateSubjectParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Some(canonical) = params.canonical_subject_id.as_deref() {
        if let Err(e) = require_in_tenant(
            conn,
            "canonical_subjects",
            "canonical subject",
            canonical,
            &params.tenant_id,
        ) {
            return e.response(&req.id);
        }
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, tenant_id, name, canonical_subject_id) VALUES(?1, ?2, ?3, ?4)",
        (
            &subject_id,
            &params.tenant_id,
            params.name.trim(),
            &params.canonical_subject_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    ok(&req.id, json!({ "subjectId": subject_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePersonParams {
    tenant_id: String,
    full_name: String,
}

fn handle_create_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreatePersonParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, tenant_id, full_name) VALUES(?1, ?2, ?3)",
        (&teacher_id, &params.tenant_id, params.full_name.trim()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }
    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_create_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params: CreatePersonParams = match parse_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, tenant_id, full_name) VALUES(?1, ?2, ?3)",
        (&student_id, &params.tenant_id, params.full_name.trim()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.createClass" => Some(handle_create_class(state, req)),
        "catalog.createCanonicalSubject" => Some(handle_create_canonical_subject(state, req)),
        "catalog.createSubject" => Some(handle_create_subject(state, req)),
        "catalog.createTeacher" => Some(handle_create_teacher(state, req)),
        "catalog.createStudent" => Some(handle_create_student(state, req)),
        _ => None,
    }
}
