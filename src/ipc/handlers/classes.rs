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

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    // Empty class scope short-circuits without touching the table.
    if !scope.unrestricted && scope.class_ids.is_empty() {
        return ok(&req.id, json!({ "classes": [] }));
    }

    let base = "SELECT
           c.id,
           c.name,
           c.homeroom_teacher_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c";
    let (sql, binds): (String, Vec<Value>) = if scope.unrestricted {
        (format!("{} ORDER BY c.name", base), Vec::new())
    } else {
        let ids: Vec<Value> = scope
            .class_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();
        (
            format!(
                "{} WHERE c.id IN ({}) ORDER BY c.name",
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
            let name: String = row.get(1)?;
            let homeroom_teacher_id: Option<String> = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "homeroomTeacherId": homeroom_teacher_id,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn check_homeroom_teacher(
    conn: &rusqlite::Connection,
    req: &Request,
    teacher_id: Option<&str>,
) -> Result<(), serde_json::Value> {
    let Some(tid) = teacher_id else {
        return Ok(());
    };
    let exists = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [tid], |_| Ok(()))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if exists.is_none() {
        return Err(err(&req.id, "not_found", "homeroom teacher not found", None));
    }
    Ok(())
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let homeroom_teacher_id = req
        .params
        .get("homeroomTeacherId")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    if let Err(resp) = check_homeroom_teacher(conn, req, homeroom_teacher_id.as_deref()) {
        return resp;
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, homeroom_teacher_id) VALUES(?, ?, ?)",
        (&class_id, &name, &homeroom_teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    // homeroomTeacherId: absent keeps the current value, null clears it.
    let homeroom_update = match req.params.get("homeroomTeacherId") {
        None => None,
        Some(v) if v.is_null() => Some(None),
        Some(v) => match v.as_str() {
            Some(s) => Some(Some(s.to_string())),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "homeroomTeacherId must be string or null",
                    None,
                )
            }
        },
    };
    if let Some(Some(tid)) = homeroom_update.as_ref() {
        if let Err(resp) = check_homeroom_teacher(conn, req, Some(tid)) {
            return resp;
        }
    }

    let updated = match homeroom_update {
        Some(homeroom) => conn.execute(
            "UPDATE classes SET name = ?, homeroom_teacher_id = ? WHERE id = ?",
            (&name, &homeroom, &class_id),
        ),
        None => conn.execute(
            "UPDATE classes SET name = ? WHERE id = ?",
            (&name, &class_id),
        ),
    };
    match updated {
        Ok(0) => err(&req.id, "not_found", "class not found", None),
        Ok(_) => ok(&req.id, json!({ "classId": class_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let student_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_count > 0 {
        return err(
            &req.id,
            "conflict",
            "class still has students",
            Some(json!({ "studentCount": student_count })),
        );
    }

    let deleted = match conn.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "class not found", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
