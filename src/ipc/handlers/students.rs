use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, principal, require_access, require_admin, required_str, scope_for,
    sql_placeholders,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{Role, TargetKind};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const LIST_DEFAULT_PAGE_SIZE: i64 = 50;
const LIST_MAX_PAGE_SIZE: i64 = 500;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let class_filter = optional_str(req, "classId");
    let search = optional_str(req, "search").map(|s| s.trim().to_string());
    let page = req.params.get("page").and_then(|v| v.as_i64()).unwrap_or(1);
    let page_size = req
        .params
        .get("pageSize")
        .and_then(|v| v.as_i64())
        .unwrap_or(LIST_DEFAULT_PAGE_SIZE);
    if page < 1 || page_size < 1 || page_size > LIST_MAX_PAGE_SIZE {
        return err(
            &req.id,
            "bad_params",
            "page must be >= 1 and pageSize in 1..=500",
            Some(json!({ "page": page, "pageSize": page_size })),
        );
    }
    // The offset must stay a valid i64; an absurd page number is a caller
    // bug, not a reason to panic or wrap.
    let Some(offset) = (page - 1).checked_mul(page_size) else {
        return err(
            &req.id,
            "bad_params",
            "page out of range",
            Some(json!({ "page": page, "pageSize": page_size })),
        );
    };

    // Scope is applied before search and pagination. For a teacher the
    // visible classes are the headed ones, intersected with any requested
    // classId; an out-of-scope classId yields an empty page, not a leak.
    let mut where_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if scope.unrestricted {
        if let Some(cid) = class_filter.as_ref() {
            where_clauses.push("s.class_id = ?".to_string());
            binds.push(Value::Text(cid.clone()));
        }
    } else {
        let visible: Vec<&String> = match class_filter.as_ref() {
            Some(cid) if scope.class_ids.contains(cid) => vec![cid],
            Some(_) => Vec::new(),
            None => scope.class_ids.iter().collect(),
        };
        if visible.is_empty() {
            return ok(
                &req.id,
                json!({ "students": [], "total": 0, "page": page, "pageSize": page_size }),
            );
        }
        where_clauses.push(format!("s.class_id IN ({})", sql_placeholders(visible.len())));
        for id in visible {
            binds.push(Value::Text(id.clone()));
        }
    }

    if let Some(q) = search.as_ref().filter(|q| !q.is_empty()) {
        // One bound pattern reused across the three columns via an explicit
        // parameter index, numbered after the scope binds.
        let idx = binds.len() + 1;
        where_clauses.push(format!(
            "(s.last_name LIKE ?{i} OR s.first_name LIKE ?{i} OR s.student_no LIKE ?{i})",
            i = idx
        ));
        binds.push(Value::Text(format!("%{}%", q)));
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM students s{}", where_sql);
    let total: i64 = match conn.query_row(&count_sql, params_from_iter(binds.clone()), |r| r.get(0))
    {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let list_sql = format!(
        "SELECT s.id, s.class_id, s.last_name, s.first_name, s.student_no
         FROM students s{}
         ORDER BY s.last_name, s.first_name
         LIMIT {} OFFSET {}",
        where_sql, page_size, offset
    );
    let mut stmt = match conn.prepare(&list_sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let class_id: Option<String> = row.get(1)?;
            let last_name: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let student_no: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "lastName": last_name,
                "firstName": first_name,
                "studentNo": student_no
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(
            &req.id,
            json!({
                "students": students,
                "total": total,
                "page": page,
                "pageSize": page_size
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_access(conn, req, &scope, TargetKind::Student, &student_id) {
        return resp;
    }

    let row = conn
        .query_row(
            "SELECT id, class_id, last_name, first_name, student_no, updated_at
             FROM students WHERE id = ?",
            [&student_id],
            |r| {
                let id: String = r.get(0)?;
                let class_id: Option<String> = r.get(1)?;
                let last_name: String = r.get(2)?;
                let first_name: String = r.get(3)?;
                let student_no: Option<String> = r.get(4)?;
                let updated_at: Option<String> = r.get(5)?;
                Ok(json!({
                    "id": id,
                    "classId": class_id,
                    "lastName": last_name,
                    "firstName": first_name,
                    "studentNo": student_no,
                    "updatedAt": updated_at
                }))
            },
        )
        .optional();

    match row {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn check_class(
    conn: &rusqlite::Connection,
    req: &Request,
    class_id: Option<&str>,
) -> Result<(), serde_json::Value> {
    let Some(cid) = class_id else {
        return Ok(());
    };
    let exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [cid], |_| Ok(()))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if exists.is_none() {
        return Err(err(&req.id, "not_found", "class not found", None));
    }
    Ok(())
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_admin(req, &actor) {
        return resp;
    }

    let last_name = match required_str(req, "lastName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let class_id = optional_str(req, "classId");
    if let Err(resp) = check_class(conn, req, class_id.as_deref()) {
        return resp;
    }
    let student_no = optional_str(req, "studentNo");

    let student_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &class_id, &last_name, &first_name, &student_no, &now),
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

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_admin(req, &actor) {
        return resp;
    }

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    // classId: absent keeps the current class, null withdraws the student.
    let class_update = match req.params.get("classId") {
        None => None,
        Some(v) if v.is_null() => Some(None),
        Some(v) => match v.as_str() {
            Some(s) => Some(Some(s.to_string())),
            None => return err(&req.id, "bad_params", "classId must be string or null", None),
        },
    };
    if let Some(Some(cid)) = class_update.as_ref() {
        if let Err(resp) = check_class(conn, req, Some(cid)) {
            return resp;
        }
    }
    let student_no = optional_str(req, "studentNo");
    let now = Utc::now().to_rfc3339();

    let updated = match class_update {
        Some(class_id) => conn.execute(
            "UPDATE students
             SET class_id = ?, last_name = ?, first_name = ?, student_no = ?, updated_at = ?
             WHERE id = ?",
            (&class_id, &last_name, &first_name, &student_no, &now, &student_id),
        ),
        None => conn.execute(
            "UPDATE students
             SET last_name = ?, first_name = ?, student_no = ?, updated_at = ?
             WHERE id = ?",
            (&last_name, &first_name, &student_no, &now, &student_id),
        ),
    };
    match updated {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_admin(req, &actor) {
        return resp;
    }

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let enrollment_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrollment_count > 0 {
        return err(
            &req.id,
            "conflict",
            "student still has enrollments",
            Some(json!({ "enrollmentCount": enrollment_count })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE accounts SET student_id = NULL WHERE student_id = ?",
        [&student_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let deleted = match conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
