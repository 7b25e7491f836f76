use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, principal, require_access, require_admin, required_str, scope_for,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{Role, TargetKind};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Raw component score from params, range-checked to [0, 10]. The grade
/// engine assumes validated input; this is the validation boundary.
fn required_score(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    let v = req
        .params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing numeric {}", key), None))?;
    if !(0.0..=10.0).contains(&v) {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be in [0, 10]", key),
            Some(json!({ key: v })),
        ));
    }
    Ok(v)
}

fn grade_json(
    attendance: f64,
    midterm: f64,
    final_exam: f64,
    total: f64,
    gpa4: f64,
    letter: &str,
    computed_at: &str,
) -> serde_json::Value {
    json!({
        "attendance": attendance,
        "midterm": midterm,
        "final": final_exam,
        "total": total,
        "gpa4": gpa4,
        "letterGrade": letter,
        "classification": grading::compute_classification(Some(total)).as_str(),
        "computedAt": computed_at
    })
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let attendance = match required_score(req, "attendance") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let midterm = match required_score(req, "midterm") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let final_exam = match required_score(req, "final") {
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
    } else {
        let exists = match conn
            .query_row(
                "SELECT 1 FROM enrollments WHERE id = ?",
                [&enrollment_id],
                |_| Ok(()),
            )
            .optional()
        {
            Ok(v) => v.is_some(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if !exists {
            return err(&req.id, "not_found", "enrollment not found", None);
        }
    }

    // Derived fields are recomputed here on every write; clients can only
    // ever supply the three raw components. The single upsert keyed on
    // enrollment_id writes raw and derived values together.
    let total = grading::compute_total(attendance, midterm, final_exam);
    let gpa4 = grading::convert_to_gpa4(total);
    let letter = grading::compute_letter_grade(total);
    let computed_at = Utc::now().to_rfc3339();

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, enrollment_id, attendance, midterm, final, total, gpa4, letter_grade, computed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(enrollment_id) DO UPDATE SET
           attendance = excluded.attendance,
           midterm = excluded.midterm,
           final = excluded.final,
           total = excluded.total,
           gpa4 = excluded.gpa4,
           letter_grade = excluded.letter_grade,
           computed_at = excluded.computed_at",
        (
            &grade_id,
            &enrollment_id,
            attendance,
            midterm,
            final_exam,
            total,
            gpa4,
            letter,
            &computed_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    let mut result = grade_json(
        attendance,
        midterm,
        final_exam,
        total,
        gpa4,
        letter,
        &computed_at,
    );
    result["enrollmentId"] = json!(enrollment_id);
    ok(&req.id, result)
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let row = conn
        .query_row(
            "SELECT attendance, midterm, final, total, gpa4, letter_grade, computed_at
             FROM grades WHERE enrollment_id = ?",
            [&enrollment_id],
            |r| {
                let attendance: f64 = r.get(0)?;
                let midterm: f64 = r.get(1)?;
                let final_exam: f64 = r.get(2)?;
                let total: f64 = r.get(3)?;
                let gpa4: f64 = r.get(4)?;
                let letter: String = r.get(5)?;
                let computed_at: Option<String> = r.get(6)?;
                Ok((attendance, midterm, final_exam, total, gpa4, letter, computed_at))
            },
        )
        .optional();

    match row {
        Ok(Some((attendance, midterm, final_exam, total, gpa4, letter, computed_at))) => {
            let mut result = grade_json(
                attendance,
                midterm,
                final_exam,
                total,
                gpa4,
                &letter,
                computed_at.as_deref().unwrap_or(""),
            );
            result["enrollmentId"] = json!(enrollment_id);
            ok(&req.id, result)
        }
        Ok(None) => err(&req.id, "not_found", "no grade record for enrollment", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_list_for_course(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let semester = optional_str(req, "semester");

    let scope = match scope_for(conn, req, &actor) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    // Course teacher sees the whole course; a homeroom teacher who does not
    // teach it sees only the enrollments from classes they head.
    let mut where_clauses = vec!["e.course_id = ?1".to_string()];
    let mut binds: Vec<Value> = vec![Value::Text(course_id.clone())];
    if !scope.unrestricted && !scope.course_ids.contains(&course_id) {
        if scope.class_ids.is_empty() {
            return ok(&req.id, json!({ "rows": [] }));
        }
        let start = binds.len() + 1;
        let placeholders: Vec<String> = (0..scope.class_ids.len())
            .map(|i| format!("?{}", start + i))
            .collect();
        where_clauses.push(format!("e.class_id IN ({})", placeholders.join(",")));
        for id in &scope.class_ids {
            binds.push(Value::Text(id.clone()));
        }
    }
    if let Some(sem) = semester.as_ref() {
        where_clauses.push(format!("e.semester = ?{}", binds.len() + 1));
        binds.push(Value::Text(sem.clone()));
    }

    let sql = format!(
        "SELECT e.id, e.semester, s.last_name, s.first_name,
                g.attendance, g.midterm, g.final, g.total, g.gpa4, g.letter_grade
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         LEFT JOIN grades g ON g.enrollment_id = e.id
         WHERE {}
         ORDER BY e.semester, s.last_name, s.first_name",
        where_clauses.join(" AND ")
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let enrollment_id: String = row.get(0)?;
            let semester: String = row.get(1)?;
            let last_name: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let attendance: Option<f64> = row.get(4)?;
            let midterm: Option<f64> = row.get(5)?;
            let final_exam: Option<f64> = row.get(6)?;
            let total: Option<f64> = row.get(7)?;
            let gpa4: Option<f64> = row.get(8)?;
            let letter: Option<String> = row.get(9)?;
            Ok(json!({
                "enrollmentId": enrollment_id,
                "semester": semester,
                "studentName": format!("{}, {}", last_name, first_name),
                "attendance": attendance,
                "midterm": midterm,
                "final": final_exam,
                "total": total,
                "gpa4": gpa4,
                "letterGrade": letter,
                "classification": grading::compute_classification(total).as_str()
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => ok(&req.id, json!({ "rows": rows })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let deleted = match conn.execute(
        "DELETE FROM grades WHERE enrollment_id = ?",
        [&enrollment_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "no grade record for enrollment", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

/// Administrative repair pass: recompute every stored derived field from the
/// raw components. Run after the canonical band table changes.
fn handle_grades_recompute_all(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        "SELECT id, attendance, midterm, final, total, gpa4, letter_grade FROM grades",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<(String, f64, f64, f64, f64, f64, String)>, _> = stmt
        .query_map([], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
            ))
        })
        .and_then(|it| it.collect());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let scanned = rows.len();
    let mut updated = 0_usize;
    let computed_at = Utc::now().to_rfc3339();

    for (id, attendance, midterm, final_exam, old_total, old_gpa4, old_letter) in rows {
        let total = grading::compute_total(attendance, midterm, final_exam);
        let gpa4 = grading::convert_to_gpa4(total);
        let letter = grading::compute_letter_grade(total);
        if total == old_total && gpa4 == old_gpa4 && letter == old_letter {
            continue;
        }
        if let Err(e) = conn.execute(
            "UPDATE grades SET total = ?, gpa4 = ?, letter_grade = ?, computed_at = ? WHERE id = ?",
            (total, gpa4, letter, &computed_at, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        updated += 1;
    }

    ok(&req.id, json!({ "scanned": scanned, "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.listForCourse" => Some(handle_grades_list_for_course(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        "grades.recomputeAll" => Some(handle_grades_recompute_all(state, req)),
        _ => None,
    }
}
