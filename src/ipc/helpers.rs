use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::scope::{
    load_principal, resolve_scope, verify_access, AccessScope, Principal, Role, ScopeError,
    TargetKind,
};
use rusqlite::Connection;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn scope_error(req: &Request, e: ScopeError) -> serde_json::Value {
    err(&req.id, e.code, e.message, None)
}

/// Derives the Principal for this request from `params.actor.accountId`.
/// The shell verifies the operator upstream; an absent or unknown account id
/// is rejected here as unauthorized.
pub fn principal(conn: &Connection, req: &Request) -> Result<Principal, serde_json::Value> {
    let account_id = req
        .params
        .get("actor")
        .and_then(|v| v.get("accountId"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(&req.id, "unauthorized", "missing actor.accountId", None))?;

    match load_principal(conn, account_id) {
        Ok(Some(p)) => Ok(p),
        Ok(None) => Err(err(&req.id, "unauthorized", "unknown account", None)),
        Err(e) => Err(scope_error(req, e)),
    }
}

pub fn require_admin(req: &Request, principal: &Principal) -> Result<(), serde_json::Value> {
    if principal.role != Role::Admin {
        return Err(err(&req.id, "forbidden", "admin role required", None));
    }
    Ok(())
}

pub fn scope_for(
    conn: &Connection,
    req: &Request,
    principal: &Principal,
) -> Result<AccessScope, serde_json::Value> {
    resolve_scope(conn, principal).map_err(|e| scope_error(req, e))
}

/// Scope check that maps a denial straight to a `forbidden` response.
pub fn require_access(
    conn: &Connection,
    req: &Request,
    scope: &AccessScope,
    kind: TargetKind,
    target_id: &str,
) -> Result<(), serde_json::Value> {
    let allowed = verify_access(conn, scope, kind, target_id).map_err(|e| scope_error(req, e))?;
    if !allowed {
        return Err(err(&req.id, "forbidden", "target outside your scope", None));
    }
    Ok(())
}

pub fn sql_placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

/// True for SQLite unique/check violations, which handlers surface as
/// `conflict` rather than a generic db failure.
pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
