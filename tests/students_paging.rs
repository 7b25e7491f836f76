
use serde_json::json;
use test_support::{actor, request_err, request_ok, select_workspace, spawn_sidecar, temp_dir};

#[test]
fn scope_applies_before_search_and_pagination() {
    let ws = temp_dir("gradebookd-paging");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin = select_workspace(&mut stdin, &mut reader, &ws);
    let a = actor(&admin);

    let teacher_id = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "teachers.create",
        json!({ "actor": a, "lastName": "Hoang", "firstName": "Yen" }),
    )["teacherId"]
        .as_str()
        .unwrap()
        .to_string();
    let class_mine = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "actor": a, "name": "12A1", "homeroomTeacherId": teacher_id }),
    )["classId"]
        .as_str()
        .unwrap()
        .to_string();
    let class_other = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "classes.create",
        json!({ "actor": a, "name": "12A2" }),
    )["classId"]
        .as_str()
        .unwrap()
        .to_string();

    // Three students in the headed class, five elsewhere. The surnames in
    // the headed class sort as Anh < Chi < Mai.
    for (i, (last, class)) in [
        ("Anh", &class_mine),
        ("Chi", &class_mine),
        ("Mai", &class_mine),
        ("Bao", &class_other),
        ("Cuc", &class_other),
        ("Dao", &class_other),
        ("Mai", &class_other),
        ("Nga", &class_other),
    ]
    .iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({
                "actor": a,
                "lastName": last,
                "firstName": "Thi",
                "classId": class,
                "studentNo": format!("ST-{:03}", i)
            }),
        );
    }

    let teacher_account = request_ok(
        &mut stdin,
        &mut reader,
        "ta",
        "accounts.create",
        json!({ "actor": a, "username": "yhoang", "role": "TEACHER", "teacherId": teacher_id }),
    )["accountId"]
        .as_str()
        .unwrap()
        .to_string();
    let t = actor(&teacher_account);

    // Admin sees the full roster.
    let page = request_ok(&mut stdin, &mut reader, "p0", "students.list", json!({ "actor": a }));
    assert_eq!(page["total"].as_i64(), Some(8));

    // The teacher's total counts only the headed class, and pagination walks
    // the filtered set, not the full roster.
    let page = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "students.list",
        json!({ "actor": t, "page": 1, "pageSize": 2 }),
    );
    assert_eq!(page["total"].as_i64(), Some(3));
    let names: Vec<&str> = page["students"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["lastName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Anh", "Chi"]);

    let page = request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "students.list",
        json!({ "actor": t, "page": 2, "pageSize": 2 }),
    );
    let names: Vec<&str> = page["students"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["lastName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Mai"]);

    // Search runs inside the scoped set: "Mai" exists in both classes but
    // the teacher sees one hit.
    let page = request_ok(
        &mut stdin,
        &mut reader,
        "p3",
        "students.list",
        json!({ "actor": t, "search": "Mai" }),
    );
    assert_eq!(page["total"].as_i64(), Some(1));
    assert_eq!(
        page["students"][0]["classId"].as_str(),
        Some(class_mine.as_str())
    );
    let page = request_ok(
        &mut stdin,
        &mut reader,
        "p4",
        "students.list",
        json!({ "actor": a, "search": "Mai" }),
    );
    assert_eq!(page["total"].as_i64(), Some(2));

    // Search also matches the student number.
    let page = request_ok(
        &mut stdin,
        &mut reader,
        "p5",
        "students.list",
        json!({ "actor": a, "search": "ST-004" }),
    );
    assert_eq!(page["total"].as_i64(), Some(1));
    assert_eq!(page["students"][0]["lastName"].as_str(), Some("Cuc"));

    // Requesting the other class explicitly is an empty page, not an error.
    let page = request_ok(
        &mut stdin,
        &mut reader,
        "p6",
        "students.list",
        json!({ "actor": t, "classId": class_other }),
    );
    assert_eq!(page["total"].as_i64(), Some(0));

    for (id, params) in [
        ("b1", json!({ "actor": t, "page": 0 })),
        ("b2", json!({ "actor": t, "pageSize": 0 })),
        ("b3", json!({ "actor": t, "pageSize": 501 })),
        // Offset would overflow i64; rejected instead of wrapping.
        ("b4", json!({ "actor": t, "page": i64::MAX, "pageSize": 500 })),
    ] {
        let code = request_err(&mut stdin, &mut reader, id, "students.list", params);
        assert_eq!(code, "bad_params");
    }

    drop(stdin);
    child.wait().expect("child exit");
}

#[test]
fn duplicate_enrollment_is_a_conflict() {
    let ws = temp_dir("gradebookd-enroll-dup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin = select_workspace(&mut stdin, &mut reader, &ws);
    let a = actor(&admin);

    let course_id = request_ok(
        &mut stdin,
        &mut reader,
        "k",
        "courses.create",
        json!({ "actor": a, "code": "GEO101", "name": "Geography", "credits": 2 }),
    )["courseId"]
        .as_str()
        .unwrap()
        .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "students.create",
        json!({ "actor": a, "lastName": "Trinh", "firstName": "Kim" }),
    )["studentId"]
        .as_str()
        .unwrap()
        .to_string();

    let first = json!({
        "actor": a,
        "studentId": student_id,
        "courseId": course_id,
        "semester": "2026-1"
    });
    request_ok(&mut stdin, &mut reader, "e1", "enrollments.create", first.clone());
    let code = request_err(&mut stdin, &mut reader, "e2", "enrollments.create", first.clone());
    assert_eq!(code, "conflict");

    // The same course in another semester is a re-take, not a duplicate.
    let mut retake = first.clone();
    retake["semester"] = json!("2026-2");
    request_ok(&mut stdin, &mut reader, "e3", "enrollments.create", retake);

    // A student with enrollments cannot be deleted.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "sd",
        "students.delete",
        json!({ "actor": a, "studentId": student_id }),
    );
    assert_eq!(code, "conflict");

    drop(stdin);
    child.wait().expect("child exit");
}
