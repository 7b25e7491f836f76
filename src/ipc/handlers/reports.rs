use crate::grading::{self, GradePoint};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, principal, require_access, required_str, scope_for, sql_placeholders,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{AccessScope, Principal, Role, TargetKind};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

fn handle_course_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = k.id) AS enrollment_count,
           (SELECT COUNT(*) FROM enrollments e
              JOIN grades g ON g.enrollment_id = e.id
              WHERE e.course_id = k.id) AS graded_count
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
            let enrollment_count: i64 = row.get(4)?;
            let graded_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "credits": credits,
                "enrollmentCount": enrollment_count,
                "gradedCount": graded_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

struct CourseRow {
    enrollment_id: String,
    semester: String,
    last_name: String,
    first_name: String,
    student_no: Option<String>,
    attendance: Option<f64>,
    midterm: Option<f64>,
    final_exam: Option<f64>,
    total: Option<f64>,
    gpa4: Option<f64>,
    letter: Option<String>,
}

fn load_course_rows(
    conn: &Connection,
    course_id: &str,
    semester: Option<&str>,
) -> Result<Vec<CourseRow>, rusqlite::Error> {
    let sql = "SELECT e.id, e.semester, s.last_name, s.first_name, s.student_no,
                      g.attendance, g.midterm, g.final, g.total, g.gpa4, g.letter_grade
               FROM enrollments e
               JOIN students s ON s.id = e.student_id
               LEFT JOIN grades g ON g.enrollment_id = e.id
               WHERE e.course_id = ?1 AND (?2 IS NULL OR e.semester = ?2)
               ORDER BY e.semester, s.last_name, s.first_name";
    let mut stmt = conn.prepare(sql)?;
    stmt.query_map((course_id, semester), |row| {
        Ok(CourseRow {
            enrollment_id: row.get(0)?,
            semester: row.get(1)?,
            last_name: row.get(2)?,
            first_name: row.get(3)?,
            student_no: row.get(4)?,
            attendance: row.get(5)?,
            midterm: row.get(6)?,
            final_exam: row.get(7)?,
            total: row.get(8)?,
            gpa4: row.get(9)?,
            letter: row.get(10)?,
        })
    })
    .and_then(|it| it.collect())
}

fn course_access(
    conn: &Connection,
    req: &Request,
    actor: &Principal,
    course_id: &str,
) -> Result<AccessScope, serde_json::Value> {
    if actor.role == Role::Student {
        return Err(err(&req.id, "forbidden", "staff role required", None));
    }
    let scope = scope_for(conn, req, actor)?;
    require_access(conn, req, &scope, TargetKind::Course, course_id)?;
    Ok(scope)
}

fn handle_course_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = course_access(conn, req, &actor, &course_id) {
        return resp;
    }
    let semester = optional_str(req, "semester");

    let rows = match load_course_rows(conn, &course_id, semester.as_deref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut graded = 0_usize;
    let mut sum = 0.0_f64;
    let mut by_letter: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_classification: BTreeMap<&'static str, i64> = BTreeMap::new();
    for row in &rows {
        match row.total {
            Some(t) => {
                graded += 1;
                sum += t;
                if let Some(letter) = row.letter.as_ref() {
                    *by_letter.entry(letter.clone()).or_insert(0) += 1;
                }
                *by_classification
                    .entry(grading::compute_classification(Some(t)).as_str())
                    .or_insert(0) += 1;
            }
            None => {
                *by_classification
                    .entry(grading::Classification::NoGrade.as_str())
                    .or_insert(0) += 1;
            }
        }
    }
    let average_total = if graded > 0 {
        Some(grading::round2(sum / graded as f64))
    } else {
        None
    };

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "semester": semester,
            "enrollmentCount": rows.len(),
            "gradedCount": graded,
            "averageTotal": average_total,
            "byLetter": by_letter,
            "byClassification": by_classification
        }),
    )
}

fn handle_transcript(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Admin: always. Teacher: via scope. Student: own linked record only.
    match actor.role {
        Role::Admin => {}
        Role::Teacher => {
            let scope = match scope_for(conn, req, &actor) {
                Ok(s) => s,
                Err(resp) => return resp,
            };
            if let Err(resp) = require_access(conn, req, &scope, TargetKind::Student, &student_id) {
                return resp;
            }
        }
        Role::Student => {
            if actor.student_id.as_deref() != Some(student_id.as_str()) {
                return err(&req.id, "forbidden", "not your transcript", None);
            }
        }
    }

    let semester = optional_str(req, "semester");
    let sql = "SELECT e.id, e.semester, k.code, k.name, k.credits, g.total, g.letter_grade
               FROM enrollments e
               JOIN courses k ON k.id = e.course_id
               LEFT JOIN grades g ON g.enrollment_id = e.id
               WHERE e.student_id = ?1 AND (?2 IS NULL OR e.semester = ?2)
               ORDER BY e.semester, k.code";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<(String, String, String, String, i64, Option<f64>, Option<String>)>, _> =
        stmt.query_map((&student_id, &semester), |r| {
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

    let points: Vec<GradePoint> = rows
        .iter()
        .map(|(_, _, _, _, credits, total, _)| GradePoint {
            total: *total,
            credits: *credits,
        })
        .collect();
    let gpa = grading::compute_gpa(&points);

    let entries: Vec<serde_json::Value> = rows
        .into_iter()
        .map(
            |(enrollment_id, semester, code, name, credits, total, letter)| {
                json!({
                    "enrollmentId": enrollment_id,
                    "semester": semester,
                    "courseCode": code,
                    "courseName": name,
                    "credits": credits,
                    "total": total,
                    "letterGrade": letter,
                    "classification": grading::compute_classification(total).as_str()
                })
            },
        )
        .collect();

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "semester": semester,
            "entries": entries,
            "gpa": gpa
        }),
    )
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn fmt_opt_score(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_default()
}

fn handle_export_grade_sheet_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let actor = match principal(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = course_access(conn, req, &actor, &course_id) {
        return resp;
    }
    let semester = optional_str(req, "semester");
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    let rows = match load_course_rows(conn, &course_id, semester.as_deref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut out = String::new();
    out.push_str(
        "enrollmentId,semester,studentNo,lastName,firstName,attendance,midterm,final,total,gpa4,letterGrade,classification\n",
    );
    for row in &rows {
        let line = [
            csv_field(&row.enrollment_id),
            csv_field(&row.semester),
            csv_field(row.student_no.as_deref().unwrap_or("")),
            csv_field(&row.last_name),
            csv_field(&row.first_name),
            fmt_opt_score(row.attendance),
            fmt_opt_score(row.midterm),
            fmt_opt_score(row.final_exam),
            fmt_opt_score(row.total),
            fmt_opt_score(row.gpa4),
            csv_field(row.letter.as_deref().unwrap_or("")),
            csv_field(grading::compute_classification(row.total).as_str()),
        ]
        .join(",");
        out.push_str(&line);
        out.push('\n');
    }

    let write_result = (|| -> std::io::Result<()> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&out_path)?;
        f.write_all(out.as_bytes())?;
        Ok(())
    })();
    if let Err(e) = write_result {
        return err(
            &req.id,
            "export_failed",
            e.to_string(),
            Some(json!({ "outPath": out_path.to_string_lossy() })),
        );
    }

    ok(
        &req.id,
        json!({
            "outPath": out_path.to_string_lossy(),
            "rowCount": rows.len()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.courseList" => Some(handle_course_list(state, req)),
        "reports.courseStatistics" => Some(handle_course_statistics(state, req)),
        "reports.transcript" => Some(handle_transcript(state, req)),
        "reports.exportGradeSheetCsv" => Some(handle_export_grade_sheet_csv(state, req)),
        _ => None,
    }
}
