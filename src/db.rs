use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schedsync.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            school_year_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_tenant ON classes(tenant_id)",
        [],
    )?;

    // The graded subject catalog. Assignments and student subject records
    // reference this taxon.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS canonical_subjects(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_canonical_subjects_tenant ON canonical_subjects(tenant_id)",
        [],
    )?;

    // Timetable subject taxon. Weekly grid rows reference this;
    // canonical_subject_id links back to the graded catalog.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            canonical_subject_id TEXT,
            FOREIGN KEY(canonical_subject_id) REFERENCES canonical_subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_tenant ON subjects(tenant_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_canonical ON subjects(canonical_subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            full_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_tenant ON teachers(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            full_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_tenant ON students(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            class_id TEXT,
            subject_id TEXT NOT NULL,
            validity_mode TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES canonical_subjects(id),
            UNIQUE(tenant_id, teacher_id, class_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_teacher
         ON teacher_assignments(tenant_id, teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_class
         ON teacher_assignments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_instances(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_instances_class
         ON timetable_instances(tenant_id, class_id, end_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_rows(
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            day_of_week TEXT NOT NULL,
            period_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_1_id TEXT,
            teacher_2_id TEXT,
            room_id TEXT,
            FOREIGN KEY(instance_id) REFERENCES timetable_instances(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_1_id) REFERENCES teachers(id),
            FOREIGN KEY(teacher_2_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_rows_instance
         ON timetable_rows(instance_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_rows_instance_subject
         ON timetable_rows(instance_id, subject_id)",
        [],
    )?;

    // Materialized per-teacher schedule. Engine-maintained only.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_schedule(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            day_of_week TEXT NOT NULL,
            period_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            room_id TEXT,
            instance_id TEXT NOT NULL,
            UNIQUE(teacher_id, class_id, day_of_week, period_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_schedule_teacher
         ON teacher_schedule(tenant_id, teacher_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_schedule_class
         ON teacher_schedule(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_enrollments(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(tenant_id, student_id, class_id, school_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_enrollments_student
         ON student_enrollments(tenant_id, student_id, school_year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_enrollments_class
         ON student_enrollments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_subject_records(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            derived_subject_id TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(derived_subject_id) REFERENCES canonical_subjects(id),
            UNIQUE(tenant_id, student_id, class_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_subject_records_student
         ON student_subject_records(tenant_id, student_id, school_year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_subject_records_class
         ON student_subject_records(class_id)",
        [],
    )?;

    Ok(())
}
