
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{actor, request_err, request_ok, select_workspace, spawn_sidecar, temp_dir};

struct Fixture {
    admin: String,
    teacher_account: String,
    class_a: String,
    class_b: String,
    course_taught: String,
    course_other: String,
    student_a: String,
    student_b: String,
    enrollment_class_match: String,
    enrollment_course_match: String,
    enrollment_out_of_scope: String,
}

/// Seeds one teacher who heads class A and teaches one course. Student A sits
/// in class A enrolled in a course the teacher does not teach; student B sits
/// in class B, once in the taught course and once outside it entirely.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, admin: &str) -> Fixture {
    let mut n = 0;
    let mut next = || {
        n += 1;
        format!("seed-{}", n)
    };

    let teacher_id = request_ok(
        stdin,
        reader,
        &next(),
        "teachers.create",
        json!({ "actor": actor(admin), "lastName": "Pham", "firstName": "Quynh" }),
    )["teacherId"]
        .as_str()
        .unwrap()
        .to_string();

    let class_a = request_ok(
        stdin,
        reader,
        &next(),
        "classes.create",
        json!({ "actor": actor(admin), "name": "11A1", "homeroomTeacherId": teacher_id }),
    )["classId"]
        .as_str()
        .unwrap()
        .to_string();
    let class_b = request_ok(
        stdin,
        reader,
        &next(),
        "classes.create",
        json!({ "actor": actor(admin), "name": "11B2" }),
    )["classId"]
        .as_str()
        .unwrap()
        .to_string();

    let course_taught = request_ok(
        stdin,
        reader,
        &next(),
        "courses.create",
        json!({
            "actor": actor(admin),
            "code": "PHY201",
            "name": "Mechanics",
            "credits": 4,
            "teacherId": teacher_id
        }),
    )["courseId"]
        .as_str()
        .unwrap()
        .to_string();
    let course_other = request_ok(
        stdin,
        reader,
        &next(),
        "courses.create",
        json!({ "actor": actor(admin), "code": "CHE101", "name": "Chemistry", "credits": 3 }),
    )["courseId"]
        .as_str()
        .unwrap()
        .to_string();

    let student_a = request_ok(
        stdin,
        reader,
        &next(),
        "students.create",
        json!({ "actor": actor(admin), "lastName": "Le", "firstName": "An", "classId": class_a }),
    )["studentId"]
        .as_str()
        .unwrap()
        .to_string();
    let student_b = request_ok(
        stdin,
        reader,
        &next(),
        "students.create",
        json!({ "actor": actor(admin), "lastName": "Vo", "firstName": "Binh", "classId": class_b }),
    )["studentId"]
        .as_str()
        .unwrap()
        .to_string();

    let enrollment_class_match = request_ok(
        stdin,
        reader,
        &next(),
        "enrollments.create",
        json!({
            "actor": actor(admin),
            "studentId": student_a,
            "courseId": course_other,
            "semester": "2026-1"
        }),
    )["enrollmentId"]
        .as_str()
        .unwrap()
        .to_string();
    let enrollment_course_match = request_ok(
        stdin,
        reader,
        &next(),
        "enrollments.create",
        json!({
            "actor": actor(admin),
            "studentId": student_b,
            "courseId": course_taught,
            "semester": "2026-1"
        }),
    )["enrollmentId"]
        .as_str()
        .unwrap()
        .to_string();
    let enrollment_out_of_scope = request_ok(
        stdin,
        reader,
        &next(),
        "enrollments.create",
        json!({
            "actor": actor(admin),
            "studentId": student_b,
            "courseId": course_other,
            "semester": "2026-1"
        }),
    )["enrollmentId"]
        .as_str()
        .unwrap()
        .to_string();

    let teacher_account = request_ok(
        stdin,
        reader,
        &next(),
        "accounts.create",
        json!({
            "actor": actor(admin),
            "username": "qpham",
            "role": "TEACHER",
            "teacherId": teacher_id
        }),
    )["accountId"]
        .as_str()
        .unwrap()
        .to_string();

    Fixture {
        admin: admin.to_string(),
        teacher_account,
        class_a,
        class_b,
        course_taught,
        course_other,
        student_a,
        student_b,
        enrollment_class_match,
        enrollment_course_match,
        enrollment_out_of_scope,
    }
}

#[test]
fn teacher_scope_filters_lists_and_gates_writes() {
    let ws = temp_dir("gradebookd-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin = select_workspace(&mut stdin, &mut reader, &ws);
    let fx = seed(&mut stdin, &mut reader, &admin);
    let t = actor(&fx.teacher_account);

    // Admin sees everything.
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "ac",
        "classes.list",
        json!({ "actor": actor(&fx.admin) }),
    );
    assert_eq!(classes["classes"].as_array().unwrap().len(), 2);

    // The teacher's class list is only the headed class.
    let classes = request_ok(&mut stdin, &mut reader, "tc", "classes.list", json!({ "actor": t }));
    let rows = classes["classes"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_str(), Some(fx.class_a.as_str()));

    let courses = request_ok(&mut stdin, &mut reader, "tk", "courses.list", json!({ "actor": t }));
    let rows = courses["courses"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_str(), Some(fx.course_taught.as_str()));

    // Enrollments visible through either side of the scope: the homeroom
    // student's enrollment and the taught course's enrollment, but not the
    // one matching neither.
    let enrollments = request_ok(
        &mut stdin,
        &mut reader,
        "te",
        "enrollments.list",
        json!({ "actor": t }),
    );
    let ids: Vec<&str> = enrollments["enrollments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&fx.enrollment_class_match.as_str()));
    assert!(ids.contains(&fx.enrollment_course_match.as_str()));
    assert!(!ids.contains(&fx.enrollment_out_of_scope.as_str()));

    // grades.upsert accepts both in-scope enrollments and rejects the third.
    let scores = json!({ "attendance": 8.0, "midterm": 8.0, "final": 8.0 });
    for (id, enrollment) in [
        ("g1", &fx.enrollment_class_match),
        ("g2", &fx.enrollment_course_match),
    ] {
        let mut params = scores.clone();
        params["actor"] = t.clone();
        params["enrollmentId"] = json!(enrollment);
        let grade = request_ok(&mut stdin, &mut reader, id, "grades.upsert", params);
        assert_eq!(grade["total"].as_f64(), Some(8.0));
        assert_eq!(grade["letterGrade"].as_str(), Some("B+"));
    }
    let mut params = scores.clone();
    params["actor"] = t.clone();
    params["enrollmentId"] = json!(fx.enrollment_out_of_scope);
    let code = request_err(&mut stdin, &mut reader, "g3", "grades.upsert", params);
    assert_eq!(code, "forbidden");

    // Student records: homeroom student readable, the other not.
    request_ok(
        &mut stdin,
        &mut reader,
        "sa",
        "students.get",
        json!({ "actor": t, "studentId": fx.student_a }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "sb",
        "students.get",
        json!({ "actor": t, "studentId": fx.student_b }),
    );
    assert_eq!(code, "forbidden");

    // Teaching a course grants enrollment access, not class access: asking
    // for class B's roster yields an empty page rather than a leak.
    let page = request_ok(
        &mut stdin,
        &mut reader,
        "cb",
        "students.list",
        json!({ "actor": t, "classId": fx.class_b }),
    );
    assert_eq!(page["students"].as_array().unwrap().len(), 0);
    assert_eq!(page["total"].as_i64(), Some(0));

    // Teachers may enroll into taught courses only.
    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "en1",
        "enrollments.create",
        json!({
            "actor": t,
            "studentId": fx.student_a,
            "courseId": fx.course_taught,
            "semester": "2026-1"
        }),
    );
    assert!(enrolled["enrollmentId"].as_str().is_some());
    let code = request_err(
        &mut stdin,
        &mut reader,
        "en2",
        "enrollments.create",
        json!({
            "actor": t,
            "studentId": fx.student_a,
            "courseId": fx.course_other,
            "semester": "2026-2"
        }),
    );
    assert_eq!(code, "forbidden");

    drop(stdin);
    child.wait().expect("child exit");
}

#[test]
fn unlinked_teacher_account_sees_nothing() {
    let ws = temp_dir("gradebookd-unlinked");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin = select_workspace(&mut stdin, &mut reader, &ws);
    let fx = seed(&mut stdin, &mut reader, &admin);

    let unlinked = request_ok(
        &mut stdin,
        &mut reader,
        "ua",
        "accounts.create",
        json!({ "actor": actor(&admin), "username": "newhire", "role": "TEACHER" }),
    )["accountId"]
        .as_str()
        .unwrap()
        .to_string();
    let u = actor(&unlinked);

    for (id, method, key) in [
        ("l1", "classes.list", "classes"),
        ("l2", "courses.list", "courses"),
        ("l3", "enrollments.list", "enrollments"),
        ("l4", "reports.courseList", "courses"),
    ] {
        let result = request_ok(&mut stdin, &mut reader, id, method, json!({ "actor": u }));
        assert_eq!(
            result[key].as_array().unwrap().len(),
            0,
            "{} must be empty for an unlinked teacher",
            method
        );
    }

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "l5",
        "students.list",
        json!({ "actor": u }),
    );
    assert_eq!(students["students"].as_array().unwrap().len(), 0);
    assert_eq!(students["total"].as_i64(), Some(0));

    // Fail closed on every record-level check.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "d1",
        "grades.upsert",
        json!({
            "actor": u,
            "enrollmentId": fx.enrollment_class_match,
            "attendance": 5.0,
            "midterm": 5.0,
            "final": 5.0
        }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "d2",
        "students.get",
        json!({ "actor": u, "studentId": fx.student_a }),
    );
    assert_eq!(code, "forbidden");

    // Admin-only surfaces stay closed to any teacher, linked or not.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "d3",
        "accounts.list",
        json!({ "actor": u }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "d4",
        "teachers.create",
        json!({ "actor": u, "lastName": "X", "firstName": "Y" }),
    );
    assert_eq!(code, "forbidden");

    drop(stdin);
    child.wait().expect("child exit");
}
