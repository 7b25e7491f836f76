use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, is_constraint_violation, principal, require_admin, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scope::Role;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_accounts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT id, username, role, teacher_id, student_id FROM accounts ORDER BY username",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let username: String = row.get(1)?;
            let role: String = row.get(2)?;
            let teacher_id: Option<String> = row.get(3)?;
            let student_id: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "username": username,
                "role": role,
                "teacherId": teacher_id,
                "studentId": student_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(accounts) => ok(&req.id, json!({ "accounts": accounts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_accounts_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let username = match required_str(req, "username") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if username.is_empty() {
        return err(&req.id, "bad_params", "username must not be empty", None);
    }
    let role_raw = match required_str(req, "role") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if Role::parse(&role_raw).is_none() {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: ADMIN, TEACHER, STUDENT",
            Some(json!({ "role": role_raw })),
        );
    }

    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    if let Some(tid) = teacher_id.as_deref() {
        match row_exists(conn, "teachers", tid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(sid) = student_id.as_deref() {
        match row_exists(conn, "students", sid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "student not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let account_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO accounts(id, username, role, teacher_id, student_id)
         VALUES(?, ?, ?, ?, ?)",
        (&account_id, &username, &role_raw, &teacher_id, &student_id),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "username already exists",
                Some(json!({ "username": username })),
            );
        }
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "accountId": account_id, "username": username, "role": role_raw }),
    )
}

fn handle_accounts_link_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // Explicit null unlinks; absent key is rejected to avoid accidental
    // unlinking from a malformed payload.
    let teacher_id = match req.params.get("teacherId") {
        None => return err(&req.id, "bad_params", "missing teacherId (use null to unlink)", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return err(&req.id, "bad_params", "teacherId must be string or null", None),
        },
    };

    let role: Option<String> = match conn
        .query_row("SELECT role FROM accounts WHERE id = ?", [&account_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match role.as_deref() {
        None => return err(&req.id, "not_found", "account not found", None),
        Some("TEACHER") => {}
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "only TEACHER accounts can be linked to a teacher record",
                Some(json!({ "role": other })),
            )
        }
    }

    if let Some(tid) = teacher_id.as_deref() {
        match row_exists(conn, "teachers", tid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE accounts SET teacher_id = ? WHERE id = ?",
        (&teacher_id, &account_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "accountId": account_id, "teacherId": teacher_id }),
    )
}

fn row_exists(conn: &rusqlite::Connection, table: &str, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |_| Ok(()))
        .optional()
        .map(|v| v.is_some())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.list" => Some(handle_accounts_list(state, req)),
        "accounts.create" => Some(handle_accounts_create(state, req)),
        "accounts.linkTeacher" => Some(handle_accounts_link_teacher(state, req)),
        _ => None,
    }
}
