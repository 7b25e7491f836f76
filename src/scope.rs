use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADMIN" => Some(Self::Admin),
            "TEACHER" => Some(Self::Teacher),
            "STUDENT" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Teacher => "TEACHER",
            Self::Student => "STUDENT",
        }
    }
}

/// The authenticated caller for one request, loaded from `accounts`.
/// The upstream shell verifies the operator's credentials; the daemon only
/// trusts the account id it is handed.
#[derive(Debug, Clone)]
pub struct Principal {
    pub account_id: String,
    pub role: Role,
    pub teacher_id: Option<String>,
    pub student_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScopeError {
    pub code: &'static str,
    pub message: String,
}

impl ScopeError {
    fn query(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }
}

pub fn load_principal(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<Principal>, ScopeError> {
    let row: Option<(String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT role, teacher_id, student_id FROM accounts WHERE id = ?",
            [account_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(ScopeError::query)?;

    let Some((role_raw, teacher_id, student_id)) = row else {
        return Ok(None);
    };
    // The CHECK constraint keeps role in the known set; an unknown value
    // here means a tampered db, which we treat as no principal.
    let Some(role) = Role::parse(&role_raw) else {
        return Ok(None);
    };

    Ok(Some(Principal {
        account_id: account_id.to_string(),
        role,
        teacher_id,
        student_id,
    }))
}

/// What a principal may see. `unrestricted` is true only for ADMIN. For a
/// TEACHER the sets are always concrete; empty sets mean no access, never
/// all access. Recomputed per request — assignments can change between
/// requests and a stale scope would be a security hole.
#[derive(Debug, Clone)]
pub struct AccessScope {
    pub unrestricted: bool,
    pub teacher_id: Option<String>,
    pub class_ids: HashSet<String>,
    pub course_ids: HashSet<String>,
}

impl AccessScope {
    pub fn unrestricted() -> Self {
        Self {
            unrestricted: true,
            teacher_id: None,
            class_ids: HashSet::new(),
            course_ids: HashSet::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            unrestricted: false,
            teacher_id: None,
            class_ids: HashSet::new(),
            course_ids: HashSet::new(),
        }
    }

    /// True when the scope cannot match anything. List handlers use this to
    /// return an empty page without touching the underlying tables.
    pub fn is_empty(&self) -> bool {
        !self.unrestricted && self.class_ids.is_empty() && self.course_ids.is_empty()
    }
}

pub fn resolve_scope(conn: &Connection, principal: &Principal) -> Result<AccessScope, ScopeError> {
    match principal.role {
        Role::Admin => Ok(AccessScope::unrestricted()),
        // Students have a separate self-service path keyed on their linked
        // student record; handlers must gate them out before resolving a
        // staff scope.
        Role::Student => Err(ScopeError {
            code: "forbidden",
            message: "student accounts have no staff scope".to_string(),
        }),
        Role::Teacher => {
            let Some(teacher_id) = principal.teacher_id.as_deref() else {
                // Unlinked teacher account: valid state, zero access.
                return Ok(AccessScope::empty());
            };

            let mut class_stmt = conn
                .prepare("SELECT id FROM classes WHERE homeroom_teacher_id = ?")
                .map_err(ScopeError::query)?;
            let class_ids: HashSet<String> = class_stmt
                .query_map([teacher_id], |r| r.get(0))
                .and_then(|it| it.collect())
                .map_err(ScopeError::query)?;

            let mut course_stmt = conn
                .prepare("SELECT id FROM courses WHERE teacher_id = ?")
                .map_err(ScopeError::query)?;
            let course_ids: HashSet<String> = course_stmt
                .query_map([teacher_id], |r| r.get(0))
                .and_then(|it| it.collect())
                .map_err(ScopeError::query)?;

            Ok(AccessScope {
                unrestricted: false,
                teacher_id: Some(teacher_id.to_string()),
                class_ids,
                course_ids,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Class,
    Course,
    Student,
    Enrollment,
}

/// Whether the scope permits acting on one specific record. Fails closed:
/// a missing row or a NULL reference is a denial, never a pass.
pub fn verify_access(
    conn: &Connection,
    scope: &AccessScope,
    kind: TargetKind,
    target_id: &str,
) -> Result<bool, ScopeError> {
    if scope.unrestricted {
        return Ok(true);
    }

    match kind {
        TargetKind::Class => Ok(scope.class_ids.contains(target_id)),
        TargetKind::Course => Ok(scope.course_ids.contains(target_id)),
        TargetKind::Student => {
            let class_id: Option<Option<String>> = conn
                .query_row(
                    "SELECT class_id FROM students WHERE id = ?",
                    [target_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(ScopeError::query)?;
            match class_id {
                Some(Some(cid)) => Ok(scope.class_ids.contains(&cid)),
                // Classless student, or no such student.
                Some(None) | None => Ok(false),
            }
        }
        TargetKind::Enrollment => {
            let row: Option<(Option<String>, String)> = conn
                .query_row(
                    "SELECT class_id, course_id FROM enrollments WHERE id = ?",
                    [target_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(ScopeError::query)?;
            let Some((class_id, course_id)) = row else {
                return Ok(false);
            };
            // Either relationship suffices: homeroom head of the student's
            // class, or teacher of the enrolled course.
            let class_ok = class_id
                .map(|cid| scope.class_ids.contains(&cid))
                .unwrap_or(false);
            Ok(class_ok || scope.course_ids.contains(&course_id))
        }
    }
}
