use crate::model::{parse_iso_date, Validity};
use crate::projector::{self, ProjectionOutcome};
use chrono::NaiveDate;
use log::{debug, info, warn};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::collections::HashMap;

/// The set of classes and graded subjects a batch of assignment deltas
/// touches, plus the date from which instances are considered.
#[derive(Debug, Clone)]
pub struct SyncScope {
    pub class_ids: Vec<String>,
    pub subject_ids: Vec<String>,
    pub horizon: NaiveDate,
}

impl SyncScope {
    pub fn is_empty(&self) -> bool {
        self.class_ids.is_empty() || self.subject_ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub rows_updated: i64,
    pub rows_skipped: i64,
    pub instances_checked: i64,
    pub logs: Vec<String>,
    pub schedule: Option<ProjectionOutcome>,
}

struct InstanceInfo {
    class_id: String,
    start_date: NaiveDate,
}

struct GridRow {
    id: String,
    instance_id: String,
    subject_id: String,
    day_of_week: String,
    period_id: String,
    teacher_1_id: Option<String>,
    teacher_2_id: Option<String>,
}

enum SlotWrite {
    Fill { row_id: String, slot: u8 },
    Clear { row_id: String, slot: u8 },
}

fn placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(",")
}

/// Reconciles every timetable cell in scope against the teacher's current
/// assignment state, then refreshes the materialized schedule for the same
/// scope.
///
/// Properties this must keep: re-running with unchanged assignment state is
/// a no-op (all rows skipped), and no write ever removes a different
/// teacher from a slot.
pub fn sync_teacher_scope(
    conn: &Connection,
    tenant_id: &str,
    teacher_id: &str,
    scope: &SyncScope,
) -> anyhow::Result<SyncReport> {
    let mut report = SyncReport::default();
    if scope.is_empty() {
        report.logs.push("nothing in scope to sync".to_string());
        return Ok(report);
    }

    let horizon = scope.horizon.format("%Y-%m-%d").to_string();

    // Active instances for the affected classes, one query.
    let sql = format!(
        "SELECT id, class_id, start_date
         FROM timetable_instances
         WHERE tenant_id = ? AND end_date >= ? AND class_id IN ({})
         ORDER BY start_date",
        placeholders(scope.class_ids.len())
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(tenant_id.to_string()),
        Value::Text(horizon.clone()),
    ];
    binds.extend(scope.class_ids.iter().map(|c| Value::Text(c.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let instance_rows = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut instances: HashMap<String, InstanceInfo> = HashMap::new();
    for (id, class_id, start_raw) in instance_rows {
        let Some(start_date) = parse_iso_date(&start_raw) else {
            report
                .logs
                .push(format!("instance {}: unparseable start date, skipped", id));
            continue;
        };
        instances.insert(
            id,
            InstanceInfo {
                class_id,
                start_date,
            },
        );
    }
    report.instances_checked = instances.len() as i64;

    if instances.is_empty() {
        report
            .logs
            .push("no active timetable instances for affected classes".to_string());
        return Ok(report);
    }

    // Timetable subjects mapping to the affected graded subjects, one query.
    let sql = format!(
        "SELECT id, canonical_subject_id FROM subjects
         WHERE tenant_id = ? AND canonical_subject_id IN ({})",
        placeholders(scope.subject_ids.len())
    );
    let mut binds: Vec<Value> = vec![Value::Text(tenant_id.to_string())];
    binds.extend(scope.subject_ids.iter().map(|s| Value::Text(s.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let canonical_of: HashMap<String, String> = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    if canonical_of.is_empty() {
        report
            .logs
            .push("no timetable subjects map to the affected subjects".to_string());
        return Ok(report);
    }

    // Every matching cell across the scoped instances, one query.
    let instance_ids: Vec<&String> = instances.keys().collect();
    let grid_subject_ids: Vec<&String> = canonical_of.keys().collect();
    let sql = format!(
        "SELECT id, instance_id, subject_id, day_of_week, period_id, teacher_1_id, teacher_2_id
         FROM timetable_rows
         WHERE instance_id IN ({}) AND subject_id IN ({})
         ORDER BY day_of_week, period_id",
        placeholders(instance_ids.len()),
        placeholders(grid_subject_ids.len())
    );
    let mut binds: Vec<Value> = instance_ids
        .iter()
        .map(|i| Value::Text((*i).clone()))
        .collect();
    binds.extend(grid_subject_ids.iter().map(|s| Value::Text((*s).clone())));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok(GridRow {
                id: row.get(0)?,
                instance_id: row.get(1)?,
                subject_id: row.get(2)?,
                day_of_week: row.get(3)?,
                period_id: row.get(4)?,
                teacher_1_id: row.get(5)?,
                teacher_2_id: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // The teacher's current assignment state for the affected subjects.
    let sql = format!(
        "SELECT subject_id, class_id, validity_mode, start_date, end_date
         FROM teacher_assignments
         WHERE tenant_id = ? AND teacher_id = ? AND subject_id IN ({})",
        placeholders(scope.subject_ids.len())
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(tenant_id.to_string()),
        Value::Text(teacher_id.to_string()),
    ];
    binds.extend(scope.subject_ids.iter().map(|s| Value::Text(s.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let assignment_rows = stmt
        .query_map(params_from_iter(binds), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut assignments: HashMap<(String, String), Validity> = HashMap::new();
    for (subject_id, class_id, mode, start, end) in assignment_rows {
        // An assignment not yet tied to a class has no timetable effect.
        let Some(class_id) = class_id else {
            continue;
        };
        let validity = Validity::from_db(&mode, start.as_deref(), end.as_deref())?;
        assignments.insert((subject_id, class_id), validity);
    }

    // Where the teacher already stands in active grids, for double-booking
    // advisories. Advisory only; never blocks a write.
    let mut stmt = conn.prepare(
        "SELECT r.day_of_week, r.period_id, i.class_id, r.subject_id
         FROM timetable_rows r
         JOIN timetable_instances i ON i.id = r.instance_id
         WHERE i.tenant_id = ?1 AND i.end_date >= ?2
           AND (r.teacher_1_id = ?3 OR r.teacher_2_id = ?3)",
    )?;
    let occupied_rows = stmt
        .query_map((tenant_id, &horizon, teacher_id), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut occupied: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
    for (day, period, class_id, subject_id) in occupied_rows {
        occupied
            .entry((day, period))
            .or_default()
            .push((class_id, subject_id));
    }

    // Decide the desired slot state per row, without touching other
    // teachers' slots.
    let mut writes: Vec<SlotWrite> = Vec::new();
    for row in &rows {
        let Some(instance) = instances.get(&row.instance_id) else {
            continue;
        };
        let Some(canonical) = canonical_of.get(&row.subject_id) else {
            continue;
        };

        let desired = assignments
            .get(&(canonical.clone(), instance.class_id.clone()))
            .map(|v| v.covers_instance_start(instance.start_date))
            .unwrap_or(false);

        let held_slot = if row.teacher_1_id.as_deref() == Some(teacher_id) {
            Some(1u8)
        } else if row.teacher_2_id.as_deref() == Some(teacher_id) {
            Some(2u8)
        } else {
            None
        };

        match (desired, held_slot) {
            (true, Some(_)) | (false, None) => {
                report.rows_skipped += 1;
            }
            (true, None) => {
                let slot = if row.teacher_1_id.is_none() {
                    Some(1u8)
                } else if row.teacher_2_id.is_none() {
                    Some(2u8)
                } else {
                    None
                };
                match slot {
                    Some(slot) => {
                        let slot_key = (row.day_of_week.clone(), row.period_id.clone());
                        if let Some(elsewhere) = occupied.get(&slot_key) {
                            for (other_class, other_subject) in elsewhere {
                                if *other_class != instance.class_id
                                    || *other_subject != row.subject_id
                                {
                                    report.logs.push(format!(
                                        "double booking: {} {} also held in class {}",
                                        row.day_of_week, row.period_id, other_class
                                    ));
                                }
                            }
                        }
                        occupied
                            .entry(slot_key)
                            .or_default()
                            .push((instance.class_id.clone(), row.subject_id.clone()));
                        writes.push(SlotWrite::Fill {
                            row_id: row.id.clone(),
                            slot,
                        });
                    }
                    None => {
                        report.rows_skipped += 1;
                        report.logs.push(format!(
                            "conflict: row {} ({} {}) has both slots occupied, skipped",
                            row.id, row.day_of_week, row.period_id
                        ));
                    }
                }
            }
            (false, Some(slot)) => {
                writes.push(SlotWrite::Clear {
                    row_id: row.id.clone(),
                    slot,
                });
            }
        }
    }

    // Apply every slot write in one transaction. Guarded updates keep a
    // racing sync for another teacher from being clobbered: a fill that
    // finds the slot taken is downgraded to a skip.
    let tx = conn.unchecked_transaction()?;
    for write in &writes {
        match write {
            SlotWrite::Fill { row_id, slot } => {
                let sql = if *slot == 1 {
                    "UPDATE timetable_rows SET teacher_1_id = ?1
                     WHERE id = ?2 AND teacher_1_id IS NULL"
                } else {
                    "UPDATE timetable_rows SET teacher_2_id = ?1
                     WHERE id = ?2 AND teacher_2_id IS NULL"
                };
                let n = tx.execute(sql, (teacher_id, row_id))?;
                if n == 1 {
                    report.rows_updated += 1;
                } else {
                    report.rows_skipped += 1;
                    report
                        .logs
                        .push(format!("conflict: row {} slot taken concurrently", row_id));
                }
            }
            SlotWrite::Clear { row_id, slot } => {
                let sql = if *slot == 1 {
                    "UPDATE timetable_rows SET teacher_1_id = NULL
                     WHERE id = ?1 AND teacher_1_id = ?2"
                } else {
                    "UPDATE timetable_rows SET teacher_2_id = NULL
                     WHERE id = ?1 AND teacher_2_id = ?2"
                };
                let n = tx.execute(sql, (row_id, teacher_id))?;
                if n == 1 {
                    report.rows_updated += 1;
                } else {
                    report.rows_skipped += 1;
                }
            }
        }
    }

    // Drop the teacher's materialized window for every class in scope;
    // projection below rebuilds whatever the reconciled slots and validity
    // windows still imply. Pruning on slot clears alone would leave stale
    // dated entries behind when a validity window merely narrows.
    let sql = format!(
        "DELETE FROM teacher_schedule
         WHERE tenant_id = ? AND teacher_id = ? AND date >= ? AND class_id IN ({})",
        placeholders(scope.class_ids.len())
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(tenant_id.to_string()),
        Value::Text(teacher_id.to_string()),
        Value::Text(horizon.clone()),
    ];
    binds.extend(scope.class_ids.iter().map(|c| Value::Text(c.clone())));
    let pruned = tx.execute(&sql, params_from_iter(binds))?;
    if pruned > 0 {
        report
            .logs
            .push(format!("pruned {} materialized entries for rebuild", pruned));
    }
    tx.commit()?;

    info!(
        "sync teacher {}: {} updated, {} skipped across {} instances",
        teacher_id, report.rows_updated, report.rows_skipped, report.instances_checked
    );

    // Projection is best-effort and reconstructible; its failure must not
    // undo the committed write phase.
    match projector::project(conn, tenant_id, teacher_id, &scope.class_ids, scope.horizon) {
        Ok(outcome) => {
            debug!(
                "projection after sync: {} created, {} updated",
                outcome.created, outcome.updated
            );
            report.schedule = Some(outcome);
        }
        Err(e) => {
            warn!("schedule projection failed for {}: {}", teacher_id, e);
            report
                .logs
                .push(format!("schedule projection failed: {}", e));
        }
    }

    Ok(report)
}
