use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, principal, require_admin, required_str, scope_for, sql_placeholders,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::Role;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    if !scope.unrestricted && scope.course_ids.is_empty() {
        return ok(&req.id, json!({ "courses": [] }));
    }

    let base = "SELECT
           k.id,
           k.code,
           k.name,
           k.credits,
           k.teacher_id,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = k.id) AS enrollment_count
         FROM courses k";
    let (sql, binds): (String, Vec<Value>) = if scope.unrestricted {
        (format!("{} ORDER BY k.code", base), Vec::new())
    } else {
        let ids: Vec<Value> = scope
            .course_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();
        (
            format!(
                "{} WHERE k.id IN ({}) ORDER BY k.code",
                base,
                sql_placeholders(ids.len())
            ),
            ids,
        )
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let credits: i64 = row.get(3)?;
            let teacher_id: Option<String> = row.get(4)?;
            let enrollment_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "credits": credits,
                "teacherId": teacher_id,
                "enrollmentCount": enrollment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_course_fields(
    conn: &rusqlite::Connection,
    req: &Request,
) -> Result<(String, String, i64, Option<String>), serde_json::Value> {
    let code = required_str(req, "code")?.trim().to_string();
    let name = required_str(req, "name")?.trim().to_string();
    if code.is_empty() || name.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            "code and name must not be empty",
            None,
        ));
    }
    let credits = match req.params.get("credits").and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => v,
        _ => {
            return Err(err(
                &req.id,
                "bad_params",
                "credits must be a non-negative integer",
                None,
            ))
        }
    };
    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    if let Some(tid) = teacher_id.as_deref() {
        let exists = conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [tid], |_| Ok(()))
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        if exists.is_none() {
            return Err(err(&req.id, "not_found", "teacher not found", None));
        }
    }
    Ok((code, name, credits, teacher_id))
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let (code, name, credits, teacher_id) = match parse_course_fields(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, code, name, credits, teacher_id) VALUES(?, ?, ?, ?, ?)",
        (&course_id, &code, &name, credits, &teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "code": code }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let (code, name, credits, teacher_id) = match parse_course_fields(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let updated = match conn.execute(
        "UPDATE courses SET code = ?, name = ?, credits = ?, teacher_id = ? WHERE id = ?",
        (&code, &name, credits, &teacher_id, &course_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "course not found", None);
    }

    ok(&req.id, json!({ "courseId": course_id }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let enrollment_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrollment_count > 0 {
        return err(
            &req.id,
            "conflict",
            "course still has enrollments",
            Some(json!({ "enrollmentCount": enrollment_count })),
        );
    }

    let deleted = match conn.execute("DELETE FROM courses WHERE id = ?", [&course_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "course not found", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        _ => None,
    }
}
