use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, principal, require_admin, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scope::Role;
use serde_json::json;
use uuid::Uuid;

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT
           t.id,
           t.last_name,
           t.first_name,
           t.email,
           (SELECT COUNT(*) FROM classes c WHERE c.homeroom_teacher_id = t.id) AS class_count,
           (SELECT COUNT(*) FROM courses k WHERE k.teacher_id = t.id) AS course_count
         FROM teachers t
         ORDER BY t.last_name, t.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let email: Option<String> = row.get(3)?;
            let class_count: i64 = row.get(4)?;
            let course_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "email": email,
                "homeroomClassCount": class_count,
                "courseCount": course_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, last_name, first_name, email) VALUES(?, ?, ?, ?)",
        (&teacher_id, &last_name, &first_name, &email),
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

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let teacher_id = match required_str(req, "teacherId") {
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
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let updated = match conn.execute(
        "UPDATE teachers SET last_name = ?, first_name = ?, email = ? WHERE id = ?",
        (&last_name, &first_name, &email, &teacher_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let references: i64 = match conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM classes WHERE homeroom_teacher_id = ?1)
         + (SELECT COUNT(*) FROM courses WHERE teacher_id = ?1)",
        [&teacher_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if references > 0 {
        return err(
            &req.id,
            "conflict",
            "teacher is still assigned to classes or courses",
            Some(json!({ "references": references })),
        );
    }

    // Unlink any accounts pointing at this teacher before removal.
    if let Err(e) = conn.execute(
        "UPDATE accounts SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let deleted = match conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        _ => None,
    }
}
