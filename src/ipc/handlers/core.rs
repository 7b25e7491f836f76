use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };

    // A brand-new workspace has no accounts; seed a bootstrap admin so the
    // shell can set up the rest through the normal handlers.
    let bootstrap_admin = match seed_bootstrap_admin(&conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    state.workspace = Some(path.clone());
    state.db = Some(conn);

    let mut result = json!({ "workspacePath": path.to_string_lossy() });
    if let Some(account_id) = bootstrap_admin {
        result["bootstrapAdminAccountId"] = json!(account_id);
    }
    ok(&req.id, result)
}

fn seed_bootstrap_admin(conn: &rusqlite::Connection) -> anyhow::Result<Option<String>> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(None);
    }
    let account_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts(id, username, role, teacher_id, student_id)
         VALUES(?, 'admin', 'ADMIN', NULL, NULL)",
        [&account_id],
    )?;
    Ok(Some(account_id))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
