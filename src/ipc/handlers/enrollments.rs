use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, is_constraint_violation, optional_str, principal, require_access, required_str,
    scope_for, sql_placeholders,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{Role, TargetKind};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if actor.role == Role::Student {
        return err(&req.id, "forbidden", "staff role required", None);
    }
    let scope = match scope_for(conn, req, &actor) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    if scope.is_empty() {
        return ok(&req.id, json!({ "enrollments": [] }));
    }

    let mut where_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    // Scope clause first: either relationship (headed class, taught course)
    // makes an enrollment visible to a teacher.
    if !scope.unrestricted {
        let mut scope_parts: Vec<String> = Vec::new();
        if !scope.class_ids.is_empty() {
            scope_parts.push(format!(
                "e.class_id IN ({})",
                sql_placeholders(scope.class_ids.len())
            ));
            for id in &scope.class_ids {
                binds.push(Value::Text(id.clone()));
            }
        }
        if !scope.course_ids.is_empty() {
            scope_parts.push(format!(
                "e.course_id IN ({})",
                sql_placeholders(scope.course_ids.len())
            ));
            for id in &scope.course_ids {
                binds.push(Value::Text(id.clone()));
            }
        }
        where_clauses.push(format!("({})", scope_parts.join(" OR ")));
    }

    for (key, column) in [
        ("studentId", "e.student_id"),
        ("courseId", "e.course_id"),
        ("semester", "e.semester"),
    ] {
        if let Some(v) = optional_str(req, key) {
            where_clauses.push(format!("{} = ?{}", column, binds.len() + 1));
            binds.push(Value::Text(v));
        }
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT e.id, e.student_id, e.class_id, e.course_id, e.semester,
                s.last_name, s.first_name, k.code,
                (SELECT g.total FROM grades g WHERE g.enrollment_id = e.id) AS total
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN courses k ON k.id = e.course_id{}
         ORDER BY e.semester, k.code, s.last_name, s.first_name",
        where_sql
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let class_id: Option<String> = row.get(2)?;
            let course_id: String = row.get(3)?;
            let semester: String = row.get(4)?;
            let last_name: String = row.get(5)?;
            let first_name: String = row.get(6)?;
            let course_code: String = row.get(7)?;
            let total: Option<f64> = row.get(8)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "classId": class_id,
                "courseId": course_id,
                "semester": semester,
                "studentName": format!("{}, {}", last_name, first_name),
                "courseCode": course_code,
                "total": total
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if actor.role == Role::Student {
        return err(&req.id, "forbidden", "staff role required", None);
    }

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let semester = match required_str(req, "semester") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if semester.is_empty() {
        return err(&req.id, "bad_params", "semester must not be empty", None);
    }

    // Teachers may enroll students only into courses they teach.
    if actor.role == Role::Teacher {
        let scope = match scope_for(conn, req, &actor) {
            Ok(s) => s,
            Err(resp) => return resp,
        };
        if let Err(resp) = require_access(conn, req, &scope, TargetKind::Course, &course_id) {
            return resp;
        }
    }

    // The student's current class is snapshotted onto the enrollment.
    let class_id: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let course_exists = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |_| Ok(()))
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !course_exists {
        return err(&req.id, "not_found", "course not found", None);
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, student_id, class_id, course_id, semester)
         VALUES(?, ?, ?, ?, ?)",
        (&enrollment_id, &student_id, &class_id, &course_id, &semester),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "student is already enrolled in this course for this semester",
                Some(json!({
                    "studentId": student_id,
                    "courseId": course_id,
                    "semester": semester
                })),
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(&req.id, json!({ "enrollmentId": enrollment_id }))
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if actor.role == Role::Student {
        return err(&req.id, "forbidden", "staff role required", None);
    }

    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if actor.role == Role::Teacher {
        let scope = match scope_for(conn, req, &actor) {
            Ok(s) => s,
            Err(resp) => return resp,
        };
        if let Err(resp) =
            require_access(conn, req, &scope, TargetKind::Enrollment, &enrollment_id)
        {
            return resp;
        }
    }

    let graded: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM grades WHERE enrollment_id = ?",
        [&enrollment_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if graded > 0 {
        return err(
            &req.id,
            "conflict",
            "enrollment has a grade record; delete it first",
            None,
        );
    }

    let deleted = match conn.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "enrollment not found", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        _ => None,
    }
}
