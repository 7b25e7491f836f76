
use serde_json::json;
use test_support::{actor, request, request_err, request_ok, select_workspace, spawn_sidecar, temp_dir};

#[test]
fn full_lifecycle_over_stdio() {
    let ws = temp_dir("gradebookd-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "h1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    // Methods that need a database fail cleanly before workspace.select.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "pre",
        "students.list",
        json!({ "actor": { "accountId": "nobody" } }),
    );
    assert_eq!(code, "no_workspace");

    let admin = select_workspace(&mut stdin, &mut reader, &ws);

    let health = request_ok(&mut stdin, &mut reader, "h2", "health", json!({}));
    assert_eq!(
        health.get("workspacePath").and_then(|v| v.as_str()),
        Some(ws.to_string_lossy().as_ref())
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "teachers.create",
        json!({ "actor": actor(&admin), "lastName": "Ngo", "firstName": "Lan" }),
    );
    let teacher_id = teacher["teacherId"].as_str().unwrap().to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "actor": actor(&admin), "name": "10A1", "homeroomTeacherId": teacher_id }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "k1",
        "courses.create",
        json!({
            "actor": actor(&admin),
            "code": "MATH101",
            "name": "Algebra",
            "credits": 3,
            "teacherId": teacher_id
        }),
    );
    let course_id = course["courseId"].as_str().unwrap().to_string();
    assert_eq!(course["code"].as_str(), Some("MATH101"));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({
            "actor": actor(&admin),
            "lastName": "Tran",
            "firstName": "Minh",
            "classId": class_id,
            "studentNo": "ST-001"
        }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let enrollment = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "enrollments.create",
        json!({
            "actor": actor(&admin),
            "studentId": student_id,
            "courseId": course_id,
            "semester": "2026-1"
        }),
    );
    let enrollment_id = enrollment["enrollmentId"].as_str().unwrap().to_string();

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.upsert",
        json!({
            "actor": actor(&admin),
            "enrollmentId": enrollment_id,
            "attendance": 9.0,
            "midterm": 9.0,
            "final": 9.0
        }),
    );
    assert_eq!(grade["total"].as_f64(), Some(9.0));
    assert_eq!(grade["letterGrade"].as_str(), Some("A"));
    assert_eq!(grade["gpa4"].as_f64(), Some(4.0));
    assert_eq!(grade["classification"].as_str(), Some("excellent"));

    let teachers = request_ok(
        &mut stdin,
        &mut reader,
        "tl",
        "teachers.list",
        json!({ "actor": actor(&admin) }),
    );
    let rows = teachers["teachers"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["homeroomClassCount"].as_i64(), Some(1));
    assert_eq!(rows[0]["courseCount"].as_i64(), Some(1));

    let enrollments = request_ok(
        &mut stdin,
        &mut reader,
        "el",
        "enrollments.list",
        json!({ "actor": actor(&admin), "studentId": student_id }),
    );
    assert_eq!(enrollments["enrollments"].as_array().unwrap().len(), 1);

    // A teacher referenced by a class cannot be deleted.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "td",
        "teachers.delete",
        json!({ "actor": actor(&admin), "teacherId": teacher_id }),
    );
    assert_eq!(code, "conflict");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "x1",
        "no.such.method",
        json!({}),
    );
    assert_eq!(code, "not_implemented");

    // Requests without a known actor are rejected once a workspace is open.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "x2",
        "students.list",
        json!({}),
    );
    assert_eq!(code, "unauthorized");

    let resp = request(
        &mut stdin,
        &mut reader,
        "x3",
        "students.list",
        json!({ "actor": { "accountId": "no-such-account" } }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("unauthorized"));

    drop(stdin);
    let status = child.wait().expect("child exit");
    assert!(status.success());
}

#[test]
fn bootstrap_admin_is_created_once() {
    let ws = temp_dir("gradebookd-bootstrap");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let admin = select_workspace(&mut stdin, &mut reader, &ws);
    let accounts = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "accounts.list",
        json!({ "actor": actor(&admin) }),
    );
    let rows = accounts["accounts"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["username"].as_str(), Some("admin"));
    assert_eq!(rows[0]["role"].as_str(), Some("ADMIN"));

    // Reopening the same workspace must not mint a second bootstrap account.
    let reselect = request_ok(
        &mut stdin,
        &mut reader,
        "w2",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    assert!(reselect.get("bootstrapAdminAccountId").is_none());

    let accounts = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "accounts.list",
        json!({ "actor": actor(&admin) }),
    );
    assert_eq!(accounts["accounts"].as_array().unwrap().len(), 1);

    drop(stdin);
    child.wait().expect("child exit");
}
