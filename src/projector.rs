use crate::model::{dates_for_day, parse_iso_date, Validity};
use chrono::NaiveDate;
use log::{debug, warn};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Upper bound on the weekly expansion per instance, so an instance with a
/// far-out end date cannot produce unbounded work.
pub const MAX_WEEKS_PER_INSTANCE: usize = 52;

#[derive(Debug, Default)]
pub struct ProjectionOutcome {
    pub created: i64,
    pub updated: i64,
    pub errors: Vec<String>,
}

struct InstanceScope {
    id: String,
    class_id: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

struct TeacherRow {
    id: String,
    instance_id: String,
    day_of_week: String,
    period_id: String,
    subject_id: String,
    room_id: Option<String>,
}

fn placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(",")
}

/// Expands the weekly-recurring rows a teacher occupies into dated
/// teacher_schedule entries for every active instance of the given classes.
///
/// Additive/corrective only: existing entries for the same
/// (teacher, class, day, period, date) are updated in place, and nothing is
/// deleted here. Removal is owned by the assignment sync's prune pass.
pub fn project(
    conn: &Connection,
    tenant_id: &str,
    teacher_id: &str,
    class_ids: &[String],
    horizon_start: NaiveDate,
) -> anyhow::Result<ProjectionOutcome> {
    let mut outcome = ProjectionOutcome::default();
    if class_ids.is_empty() {
        return Ok(outcome);
    }

    let horizon = horizon_start.format("%Y-%m-%d").to_string();

    // Active instances for the classes in scope, one query.
    let sql = format!(
        "SELECT id, class_id, start_date, end_date
         FROM timetable_instances
         WHERE tenant_id = ? AND end_date >= ? AND class_id IN ({})
         ORDER BY start_date",
        placeholders(class_ids.len())
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(tenant_id.to_string()),
        Value::Text(horizon.clone()),
    ];
    binds.extend(class_ids.iter().map(|c| Value::Text(c.clone())));

    let mut stmt = conn.prepare(&sql)?;
    let instances = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut scopes = Vec::new();
    for (id, class_id, start_raw, end_raw) in instances {
        let (Some(start_date), Some(end_date)) =
            (parse_iso_date(&start_raw), parse_iso_date(&end_raw))
        else {
            outcome
                .errors
                .push(format!("instance {}: unparseable date range", id));
            continue;
        };
        scopes.push(InstanceScope {
            id,
            class_id,
            start_date,
            end_date,
        });
    }

    if scopes.is_empty() {
        return Ok(outcome);
    }

    // Rows where this teacher holds a slot, across all scoped instances.
    let instance_ids: Vec<String> = scopes.iter().map(|s| s.id.clone()).collect();
    let sql = format!(
        "SELECT id, instance_id, day_of_week, period_id, subject_id, room_id
         FROM timetable_rows
         WHERE instance_id IN ({}) AND (teacher_1_id = ? OR teacher_2_id = ?)",
        placeholders(instance_ids.len())
    );
    let mut binds: Vec<Value> = instance_ids
        .iter()
        .map(|i| Value::Text(i.clone()))
        .collect();
    binds.push(Value::Text(teacher_id.to_string()));
    binds.push(Value::Text(teacher_id.to_string()));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok(TeacherRow {
                id: row.get(0)?,
                instance_id: row.get(1)?,
                day_of_week: row.get(2)?,
                period_id: row.get(3)?,
                subject_id: row.get(4)?,
                room_id: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok(outcome);
    }

    // Canonical mapping for the rows' subjects, then this teacher's
    // assignments, so each row's expansion can be clamped to the validity
    // window of the assignment that put the teacher there.
    let subject_ids: Vec<String> = rows
        .iter()
        .map(|r| r.subject_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let sql = format!(
        "SELECT id, canonical_subject_id FROM subjects
         WHERE tenant_id = ? AND id IN ({})",
        placeholders(subject_ids.len())
    );
    let mut binds: Vec<Value> = vec![Value::Text(tenant_id.to_string())];
    binds.extend(subject_ids.iter().map(|s| Value::Text(s.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let canonical_of: HashMap<String, Option<String>> = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT class_id, subject_id, validity_mode, start_date, end_date
         FROM teacher_assignments
         WHERE tenant_id = ?1 AND teacher_id = ?2 AND class_id IS NOT NULL",
    )?;
    let assignment_rows = stmt
        .query_map((tenant_id, teacher_id), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut validities: HashMap<(String, String), Validity> = HashMap::new();
    for (class_id, subject_id, mode, start, end) in assignment_rows {
        let validity = Validity::from_db(&mode, start.as_deref(), end.as_deref())?;
        validities.insert((subject_id, class_id), validity);
    }

    // Existing entries in the window, so inserts and in-place updates can be
    // decided locally instead of probing per date.
    let sql = format!(
        "SELECT id, class_id, day_of_week, period_id, date
         FROM teacher_schedule
         WHERE tenant_id = ? AND teacher_id = ? AND date >= ? AND class_id IN ({})",
        placeholders(class_ids.len())
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(tenant_id.to_string()),
        Value::Text(teacher_id.to_string()),
        Value::Text(horizon.clone()),
    ];
    binds.extend(class_ids.iter().map(|c| Value::Text(c.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let mut existing: HashMap<(String, String, String, String), String> = HashMap::new();
    let existing_rows = stmt.query_map(params_from_iter(binds), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    for entry in existing_rows {
        let (id, class_id, day, period, date) = entry?;
        existing.insert((class_id, day, period, date), id);
    }

    let instance_of: HashMap<&str, &InstanceScope> =
        scopes.iter().map(|s| (s.id.as_str(), s)).collect();

    let tx = conn.unchecked_transaction()?;
    for row in &rows {
        let Some(scope) = instance_of.get(row.instance_id.as_str()) else {
            continue;
        };

        let mut window_start = scope.start_date.max(horizon_start);
        let mut window_end = scope.end_date;
        let canonical = canonical_of.get(&row.subject_id).cloned().flatten();
        if let Some(canonical) = canonical {
            if let Some(validity) = validities.get(&(canonical, scope.class_id.clone())) {
                if let Some(start) = validity.start_date {
                    window_start = window_start.max(start);
                }
                if let Some(end) = validity.end_date {
                    window_end = window_end.min(end);
                }
            }
        }

        let dates = dates_for_day(
            &row.day_of_week,
            window_start,
            window_end,
            MAX_WEEKS_PER_INSTANCE,
        );

        for date in dates {
            let date_str = date.format("%Y-%m-%d").to_string();
            let key = (
                scope.class_id.clone(),
                row.day_of_week.clone(),
                row.period_id.clone(),
                date_str.clone(),
            );
            let (result, new_id) = if let Some(entry_id) = existing.get(&key) {
                let r = tx
                    .execute(
                        "UPDATE teacher_schedule
                         SET subject_id = ?1, room_id = ?2, instance_id = ?3
                         WHERE id = ?4",
                        (&row.subject_id, &row.room_id, &row.instance_id, entry_id),
                    )
                    .map(|_| false);
                (r, None)
            } else {
                let entry_id = Uuid::new_v4().to_string();
                let r = tx
                    .execute(
                        "INSERT INTO teacher_schedule(
                            id, tenant_id, teacher_id, class_id, date, day_of_week,
                            period_id, subject_id, room_id, instance_id)
                         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        (
                            &entry_id,
                            tenant_id,
                            teacher_id,
                            &scope.class_id,
                            &date_str,
                            &row.day_of_week,
                            &row.period_id,
                            &row.subject_id,
                            &row.room_id,
                            &row.instance_id,
                        ),
                    )
                    .map(|_| true);
                (r, Some(entry_id))
            };

            match result {
                Ok(true) => {
                    if let Some(entry_id) = new_id {
                        existing.insert(key, entry_id);
                    }
                    outcome.created += 1;
                }
                Ok(false) => outcome.updated += 1,
                Err(e) => {
                    // One bad entry must not abort the sibling dates.
                    warn!("schedule entry for row {} on {}: {}", row.id, date_str, e);
                    outcome
                        .errors
                        .push(format!("row {} on {}: {}", row.id, date_str, e));
                }
            }
        }
    }
    tx.commit()?;

    debug!(
        "projected teacher {}: {} created, {} updated, {} errors",
        teacher_id,
        outcome.created,
        outcome.updated,
        outcome.errors.len()
    );

    Ok(outcome)
}
