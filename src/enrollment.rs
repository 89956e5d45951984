use chrono::NaiveDate;
use log::{info, warn};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct EnrollmentSyncOutcome {
    pub updated_count: i64,
    pub created_count: i64,
    pub pruned_count: i64,
    pub logs: Vec<String>,
}

/// Per-student diagnostic view used by checkStatus and the forceResync
/// dry run.
#[derive(Debug)]
pub struct StudentStatus {
    pub student_id: String,
    pub school_year_id: String,
    pub mismatched_subjects: Vec<String>,
    pub missing_subjects: Vec<String>,
    pub extraneous_subjects: Vec<String>,
}

impl StudentStatus {
    pub fn is_clean(&self) -> bool {
        self.mismatched_subjects.is_empty()
            && self.missing_subjects.is_empty()
            && self.extraneous_subjects.is_empty()
    }
}

/// The subject roster a class's active timetable implies, as
/// (timetable subject id, canonical subject id) pairs. Subjects without a
/// canonical mapping are reported as warnings, never silently dropped: an
/// unnoticed roster gap would later surface as an empty report card.
pub fn class_roster(
    conn: &Connection,
    tenant_id: &str,
    class_id: &str,
    today: NaiveDate,
) -> anyhow::Result<(Vec<(String, String)>, Vec<String>)> {
    let today = today.format("%Y-%m-%d").to_string();
    let mut stmt = conn.prepare(
        "SELECT DISTINCT r.subject_id, s.canonical_subject_id, s.name
         FROM timetable_rows r
         JOIN timetable_instances i ON i.id = r.instance_id
         LEFT JOIN subjects s ON s.id = r.subject_id
         WHERE i.tenant_id = ?1 AND i.class_id = ?2 AND i.end_date >= ?3
         ORDER BY r.subject_id",
    )?;
    let rows = stmt
        .query_map((tenant_id, class_id, &today), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut roster = Vec::new();
    let mut warnings = Vec::new();
    for (subject_id, canonical, name) in rows {
        match canonical {
            Some(canonical) => roster.push((subject_id, canonical)),
            None => {
                let label = name.unwrap_or_else(|| subject_id.clone());
                warn!(
                    "class {}: subject {} has no canonical mapping, left out of roster",
                    class_id, label
                );
                warnings.push(format!(
                    "subject {} has no canonical mapping, left out of roster",
                    label
                ));
            }
        }
    }
    Ok((roster, warnings))
}

/// Realigns a student's subject records with the class they now belong to.
///
/// Records following the student into the new class are re-pointed in
/// place; records for subjects the new class does not teach are pruned so
/// the record set stays a subset of the class roster; missing roster
/// subjects get fresh records. The post-condition check at the end is a
/// consistency signal, not a gate.
pub fn sync_student_subjects(
    conn: &Connection,
    tenant_id: &str,
    student_id: &str,
    new_class_id: &str,
    school_year_id: &str,
    old_class_id: Option<&str>,
    today: NaiveDate,
) -> anyhow::Result<EnrollmentSyncOutcome> {
    let mut outcome = EnrollmentSyncOutcome::default();

    let (roster, warnings) = class_roster(conn, tenant_id, new_class_id, today)?;
    outcome.logs.extend(warnings);
    if roster.is_empty() {
        outcome.logs.push(format!(
            "class {} has no derivable subject roster",
            new_class_id
        ));
    }
    let roster_subjects: HashSet<&str> = roster.iter().map(|(s, _)| s.as_str()).collect();

    let tx = conn.unchecked_transaction()?;

    // Re-point records the new class also teaches. OR IGNORE leaves behind
    // rows that would collide with an existing new-class record; those are
    // duplicates and are collapsed below.
    if roster.is_empty() {
        // Nothing can be re-pointed into an empty roster.
    } else {
        let mark = |clause: &str| {
            format!(
                "UPDATE OR IGNORE student_subject_records
                 SET class_id = ?1
                 WHERE tenant_id = ?2 AND student_id = ?3 AND school_year_id = ?4
                   AND {} AND subject_id IN ({})",
                clause,
                std::iter::repeat_n("?", roster.len())
                    .collect::<Vec<_>>()
                    .join(",")
            )
        };
        let binds: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(new_class_id.to_string()),
            rusqlite::types::Value::Text(tenant_id.to_string()),
            rusqlite::types::Value::Text(student_id.to_string()),
            rusqlite::types::Value::Text(school_year_id.to_string()),
        ];

        if let Some(old) = old_class_id {
            let mut with_old = binds.clone();
            with_old.push(rusqlite::types::Value::Text(old.to_string()));
            with_old.extend(
                roster
                    .iter()
                    .map(|(s, _)| rusqlite::types::Value::Text(s.clone())),
            );
            let n = tx.execute(
                &mark("class_id = ?5"),
                rusqlite::params_from_iter(with_old),
            )?;
            outcome.updated_count += n as i64;
        }

        // Catch-all for records pointing at any other class (data-integrity
        // defects, or an unknown previous class).
        let mut catch_all = binds.clone();
        catch_all.push(rusqlite::types::Value::Text(new_class_id.to_string()));
        catch_all.extend(
            roster
                .iter()
                .map(|(s, _)| rusqlite::types::Value::Text(s.clone())),
        );
        let n = tx.execute(
            &mark("class_id != ?5"),
            rusqlite::params_from_iter(catch_all),
        )?;
        outcome.updated_count += n as i64;
    }

    // Whatever still points elsewhere is either a constraint-blocked
    // duplicate or a subject the new class does not teach. Both violate the
    // roster-subset invariant; prune them.
    let pruned = tx.execute(
        "DELETE FROM student_subject_records
         WHERE tenant_id = ?1 AND student_id = ?2 AND school_year_id = ?3
           AND class_id != ?4",
        (tenant_id, student_id, school_year_id, new_class_id),
    )?;
    if pruned > 0 {
        outcome.pruned_count += pruned as i64;
        outcome.logs.push(format!(
            "pruned {} records not carried by the new class",
            pruned
        ));
    }

    // Records the new class's roster still lacks.
    let mut stmt = tx.prepare(
        "SELECT subject_id FROM student_subject_records
         WHERE tenant_id = ?1 AND student_id = ?2 AND class_id = ?3 AND school_year_id = ?4",
    )?;
    let existing: HashSet<String> = stmt
        .query_map((tenant_id, student_id, new_class_id, school_year_id), |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    drop(stmt);

    for (subject_id, canonical_id) in &roster {
        if existing.contains(subject_id) {
            continue;
        }
        let record_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO student_subject_records(
                id, tenant_id, student_id, class_id, school_year_id,
                subject_id, derived_subject_id)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &record_id,
                tenant_id,
                student_id,
                new_class_id,
                school_year_id,
                subject_id,
                canonical_id,
            ),
        )?;
        outcome.created_count += 1;
    }

    // Prune new-class records for subjects outside the roster, unless the
    // roster itself came up empty (a misconfigured class must not wipe the
    // student's records without a human looking at it first).
    if !roster.is_empty() {
        let mut stmt = tx.prepare(
            "SELECT id, subject_id FROM student_subject_records
             WHERE tenant_id = ?1 AND student_id = ?2 AND class_id = ?3 AND school_year_id = ?4",
        )?;
        let current = stmt
            .query_map((tenant_id, student_id, new_class_id, school_year_id), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        for (record_id, subject_id) in current {
            if !roster_subjects.contains(subject_id.as_str()) {
                tx.execute(
                    "DELETE FROM student_subject_records WHERE id = ?1",
                    [&record_id],
                )?;
                outcome.pruned_count += 1;
                outcome.logs.push(format!(
                    "pruned record for subject {} outside the class roster",
                    subject_id
                ));
            }
        }
    }

    // Post-condition: nothing for this student/year may reference another
    // class. Surfaced as a warning, not a failure.
    let leftover: i64 = tx.query_row(
        "SELECT COUNT(*) FROM student_subject_records
         WHERE tenant_id = ?1 AND student_id = ?2 AND school_year_id = ?3 AND class_id != ?4",
        (tenant_id, student_id, school_year_id, new_class_id),
        |row| row.get(0),
    )?;
    if leftover > 0 {
        warn!(
            "student {}: {} subject records still reference another class",
            student_id, leftover
        );
        outcome.logs.push(format!(
            "integrity warning: {} records still reference another class",
            leftover
        ));
    }

    tx.commit()?;

    info!(
        "enrollment sync student {} -> class {}: {} updated, {} created, {} pruned",
        student_id,
        new_class_id,
        outcome.updated_count,
        outcome.created_count,
        outcome.pruned_count
    );

    Ok(outcome)
}

/// Read-only consistency walk over a class's primary-enrolled students.
pub fn check_class_status(
    conn: &Connection,
    tenant_id: &str,
    class_id: &str,
    today: NaiveDate,
) -> anyhow::Result<(Vec<StudentStatus>, Vec<String>)> {
    let (roster, warnings) = class_roster(conn, tenant_id, class_id, today)?;
    let roster_subjects: HashSet<&str> = roster.iter().map(|(s, _)| s.as_str()).collect();

    let mut stmt = conn.prepare(
        "SELECT student_id, school_year_id FROM student_enrollments
         WHERE tenant_id = ?1 AND class_id = ?2 AND kind = 'primary'
         ORDER BY student_id",
    )?;
    let enrolled = stmt
        .query_map((tenant_id, class_id), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut statuses = Vec::new();
    for (student_id, school_year_id) in enrolled {
        let mut stmt = conn.prepare(
            "SELECT class_id, subject_id FROM student_subject_records
             WHERE tenant_id = ?1 AND student_id = ?2 AND school_year_id = ?3",
        )?;
        let records = stmt
            .query_map((tenant_id, &student_id, &school_year_id), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut mismatched = Vec::new();
        let mut here: HashMap<String, ()> = HashMap::new();
        let mut extraneous = Vec::new();
        for (record_class, subject_id) in &records {
            if record_class != class_id {
                mismatched.push(subject_id.clone());
            } else {
                if !roster_subjects.contains(subject_id.as_str()) {
                    extraneous.push(subject_id.clone());
                }
                here.insert(subject_id.clone(), ());
            }
        }
        let missing: Vec<String> = roster
            .iter()
            .filter(|(s, _)| !here.contains_key(s))
            .map(|(s, _)| s.clone())
            .collect();

        statuses.push(StudentStatus {
            student_id,
            school_year_id,
            mismatched_subjects: mismatched,
            missing_subjects: missing,
            extraneous_subjects: extraneous,
        });
    }

    Ok((statuses, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::parse_iso_date;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn
    }

    fn seed_two_classes(conn: &Connection) {
        // Class A teaches m1 and m2; class B teaches m2 and m3. m4 exists
        // in B's grid but has no canonical mapping.
        conn.execute_batch(
            "INSERT INTO classes(id, tenant_id, name) VALUES('ca', 't1', '7A');
             INSERT INTO classes(id, tenant_id, name) VALUES('cb', 't1', '7B');
             INSERT INTO students(id, tenant_id, full_name) VALUES('s1', 't1', 'Student');
             INSERT INTO canonical_subjects(id, tenant_id, name) VALUES('g1', 't1', 'One');
             INSERT INTO canonical_subjects(id, tenant_id, name) VALUES('g2', 't1', 'Two');
             INSERT INTO canonical_subjects(id, tenant_id, name) VALUES('g3', 't1', 'Three');
             INSERT INTO subjects(id, tenant_id, name, canonical_subject_id) VALUES('m1', 't1', 'M1', 'g1');
             INSERT INTO subjects(id, tenant_id, name, canonical_subject_id) VALUES('m2', 't1', 'M2', 'g2');
             INSERT INTO subjects(id, tenant_id, name, canonical_subject_id) VALUES('m3', 't1', 'M3', 'g3');
             INSERT INTO subjects(id, tenant_id, name, canonical_subject_id) VALUES('m4', 't1', 'M4', NULL);
             INSERT INTO timetable_instances(id, tenant_id, class_id, start_date, end_date)
               VALUES('ia', 't1', 'ca', '2098-02-01', '2098-06-30');
             INSERT INTO timetable_instances(id, tenant_id, class_id, start_date, end_date)
               VALUES('ib', 't1', 'cb', '2098-02-01', '2098-06-30');
             INSERT INTO timetable_rows(id, instance_id, day_of_week, period_id, subject_id)
               VALUES('ra1', 'ia', 'mon', 'p1', 'm1');
             INSERT INTO timetable_rows(id, instance_id, day_of_week, period_id, subject_id)
               VALUES('ra2', 'ia', 'tue', 'p1', 'm2');
             INSERT INTO timetable_rows(id, instance_id, day_of_week, period_id, subject_id)
               VALUES('rb1', 'ib', 'mon', 'p1', 'm2');
             INSERT INTO timetable_rows(id, instance_id, day_of_week, period_id, subject_id)
               VALUES('rb2', 'ib', 'tue', 'p1', 'm3');
             INSERT INTO timetable_rows(id, instance_id, day_of_week, period_id, subject_id)
               VALUES('rb3', 'ib', 'wed', 'p1', 'm4');",
        )
        .expect("seed");
    }

    fn today() -> NaiveDate {
        parse_iso_date("2026-01-01").expect("date")
    }

    #[test]
    fn first_assignment_creates_roster_records() {
        let conn = test_conn();
        seed_two_classes(&conn);

        let outcome =
            sync_student_subjects(&conn, "t1", "s1", "ca", "y1", None, today()).expect("sync");
        assert_eq!(outcome.created_count, 2);
        assert_eq!(outcome.updated_count, 0);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_subject_records WHERE student_id = 's1' AND class_id = 'ca'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 2);
    }

    #[test]
    fn class_move_repoints_creates_and_prunes() {
        let conn = test_conn();
        seed_two_classes(&conn);
        sync_student_subjects(&conn, "t1", "s1", "ca", "y1", None, today()).expect("seed records");

        let outcome = sync_student_subjects(&conn, "t1", "s1", "cb", "y1", Some("ca"), today())
            .expect("move");

        // m2 follows the student; m1 is not taught in B and is pruned; m3
        // is created. m4 never enters the roster (no canonical mapping).
        assert_eq!(outcome.updated_count, 1);
        assert_eq!(outcome.created_count, 1);
        assert_eq!(outcome.pruned_count, 1);
        assert!(outcome
            .logs
            .iter()
            .any(|l| l.contains("no canonical mapping")));

        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_subject_records
                 WHERE student_id = 's1' AND school_year_id = 'y1' AND class_id != 'cb'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(stale, 0);

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_subject_records
                 WHERE student_id = 's1' AND school_year_id = 'y1'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(total, 2);
    }

    #[test]
    fn resync_is_idempotent() {
        let conn = test_conn();
        seed_two_classes(&conn);
        sync_student_subjects(&conn, "t1", "s1", "ca", "y1", None, today()).expect("first");
        let again =
            sync_student_subjects(&conn, "t1", "s1", "ca", "y1", None, today()).expect("second");
        assert_eq!(again.created_count, 0);
        assert_eq!(again.updated_count, 0);
        assert_eq!(again.pruned_count, 0);
    }

    #[test]
    fn empty_roster_prunes_mismatched_and_warns() {
        let conn = test_conn();
        seed_two_classes(&conn);
        conn.execute(
            "INSERT INTO classes(id, tenant_id, name) VALUES('cc', 't1', '7C')",
            [],
        )
        .expect("class");
        sync_student_subjects(&conn, "t1", "s1", "ca", "y1", None, today()).expect("seed records");

        // Moving into a class with no timetable: the old records cannot be
        // carried over (the post-condition still holds) and the engine
        // says so loudly.
        let outcome = sync_student_subjects(&conn, "t1", "s1", "cc", "y1", Some("ca"), today())
            .expect("move");
        assert_eq!(outcome.created_count, 0);
        assert_eq!(outcome.pruned_count, 2);
        assert!(outcome
            .logs
            .iter()
            .any(|l| l.contains("no derivable subject roster")));

        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_subject_records
                 WHERE student_id = 's1' AND school_year_id = 'y1' AND class_id != 'cc'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(stale, 0);
    }
}
