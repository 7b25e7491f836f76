use serde::Serialize;

/// Component weights for the composite score on the 0–10 scale.
pub const WEIGHT_ATTENDANCE: f64 = 0.10;
pub const WEIGHT_MIDTERM: f64 = 0.30;
pub const WEIGHT_FINAL: f64 = 0.60;

/// Canonical band table: (inclusive lower bound on total, letter, GPA-4).
/// Both the letter grade and the GPA-4 conversion read this table; any
/// change here invalidates stored derived fields, which is what
/// `grades.recomputeAll` exists to repair.
const GRADE_BANDS: &[(f64, &str, f64)] = &[
    (8.5, "A", 4.0),
    (8.0, "B+", 3.5),
    (7.0, "B", 3.0),
    (6.5, "C+", 2.5),
    (5.5, "C", 2.0),
    (5.0, "D+", 1.5),
    (4.0, "D", 1.0),
    (0.0, "F", 0.0),
];

const CLASSIFICATION_EXCELLENT_MIN: f64 = 8.0;
const CLASSIFICATION_GOOD_MIN: f64 = 6.5;
const CLASSIFICATION_AVERAGE_MIN: f64 = 5.0;

/// Round to 2 decimals, half away from zero.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Weighted composite of the three raw components. Callers are responsible
/// for range-checking inputs to [0, 10]; no clamping happens here.
pub fn compute_total(attendance: f64, midterm: f64, final_exam: f64) -> f64 {
    round2(attendance * WEIGHT_ATTENDANCE + midterm * WEIGHT_MIDTERM + final_exam * WEIGHT_FINAL)
}

fn band_for(total: f64) -> (&'static str, f64) {
    for &(lower, letter, gpa4) in GRADE_BANDS {
        if total >= lower {
            return (letter, gpa4);
        }
    }
    // Below the lowest bucket (negative input) still maps to F.
    ("F", 0.0)
}

pub fn convert_to_gpa4(total: f64) -> f64 {
    band_for(total).1
}

pub fn compute_letter_grade(total: f64) -> &'static str {
    band_for(total).0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Classification {
    NoGrade,
    Excellent,
    Good,
    Average,
    Weak,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::NoGrade => "no grade",
            Classification::Excellent => "excellent",
            Classification::Good => "good",
            Classification::Average => "average",
            Classification::Weak => "weak",
        }
    }
}

/// Qualitative label for a composite total. `None` means "not graded yet",
/// which is distinct from a real zero.
pub fn compute_classification(total: Option<f64>) -> Classification {
    let Some(t) = total else {
        return Classification::NoGrade;
    };
    if t >= CLASSIFICATION_EXCELLENT_MIN {
        Classification::Excellent
    } else if t >= CLASSIFICATION_GOOD_MIN {
        Classification::Good
    } else if t >= CLASSIFICATION_AVERAGE_MIN {
        Classification::Average
    } else {
        Classification::Weak
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradePoint {
    pub total: Option<f64>,
    pub credits: i64,
}

/// Credit-weighted mean of graded entries on the 0–10 scale.
///
/// Ungraded entries (total = None) are excluded from both numerator and
/// denominator. Returns None when nothing graded remains or when the
/// remaining credits sum to zero, so "no data" is never reported as 0.0.
pub fn compute_gpa(points: &[GradePoint]) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut credits = 0_i64;
    for p in points {
        let Some(total) = p.total else {
            continue;
        };
        sum += total * p.credits as f64;
        credits += p.credits;
    }
    if credits <= 0 {
        return None;
    }
    Some(round2(sum / credits as f64))
}
