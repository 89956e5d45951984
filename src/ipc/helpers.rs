use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> HandlerErr {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// One explicit request struct per operation, validated in a single step at
/// the boundary before anything touches the engine.
pub fn parse_params<T: DeserializeOwned>(req: &Request) -> Result<T, serde_json::Value> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| err(&req.id, "bad_params", e.to_string(), None))
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn parse_date_param(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    crate::model::parse_iso_date(raw).ok_or_else(|| {
        HandlerErr::with_details(
            "bad_params",
            format!("{} is not a valid date", key),
            json!({ key: raw }),
        )
    })
}

/// Tenant-scoped existence probe against one of the reference tables.
pub fn exists_in_tenant(
    conn: &Connection,
    table: &str,
    id: &str,
    tenant_id: &str,
) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? AND tenant_id = ? LIMIT 1", table);
    let found: Option<i64> = conn
        .query_row(&sql, (id, tenant_id), |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn require_in_tenant(
    conn: &Connection,
    table: &str,
    label: &str,
    id: &str,
    tenant_id: &str,
) -> Result<(), HandlerErr> {
    if exists_in_tenant(conn, table, id, tenant_id)? {
        Ok(())
    } else {
        Err(HandlerErr::with_details(
            "not_found",
            format!("{} not found", label),
            json!({ "id": id }),
        ))
    }
}
