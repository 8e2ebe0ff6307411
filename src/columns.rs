use csv::StringRecord;

// Accepted header spellings, matched after `norm`. Detection is purely
// header-based and never inspects row values.
pub const STUDENT_NAME_COLUMNS: &[&str] = &[
    "reader name",
    "readername",
    "student name",
    "student_name",
    "name",
];
pub const MINUTES_COLUMNS: &[&str] = &[
    "minutes",
    "minutes read",
    "minutes_read",
    "total minutes",
    "reading minutes",
];
pub const TEACHER_COLUMNS: &[&str] = &[
    "teacher",
    "teacher name",
    "teacher_name",
    "classroom teacher",
];
pub const RAISED_COLUMNS: &[&str] = &[
    "raised",
    "amount raised",
    "donations",
    "donation amount",
    "total raised",
];
pub const SPONSORS_COLUMNS: &[&str] = &[
    "sponsors",
    "sponsor count",
    "num sponsors",
    "number of sponsors",
];

/// The one case-insensitivity primitive. Applied to headers, class names,
/// team names and student names everywhere matching happens; stored values
/// keep their original casing.
pub fn norm(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnFlags {
    pub has_student_name: bool,
    pub has_minutes: bool,
    pub has_teacher: bool,
    pub has_raised: bool,
    pub has_sponsors: bool,
}

pub fn detect(headers: &StringRecord) -> ColumnFlags {
    ColumnFlags {
        has_student_name: find_column(headers, STUDENT_NAME_COLUMNS).is_some(),
        has_minutes: find_column(headers, MINUTES_COLUMNS).is_some(),
        has_teacher: find_column(headers, TEACHER_COLUMNS).is_some(),
        has_raised: find_column(headers, RAISED_COLUMNS).is_some(),
        has_sponsors: find_column(headers, SPONSORS_COLUMNS).is_some(),
    }
}

/// First header whose normalized form is in `accepted`.
pub fn find_column(headers: &StringRecord, accepted: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| accepted.contains(&norm(h).as_str()))
}

fn missing(field: &str, accepted: &[&str]) -> String {
    format!(
        "No {} column found (accepted headers: {})",
        field,
        accepted.join(", ")
    )
}

/// Column positions for one daily-minutes file, resolved once per upload.
#[derive(Debug, Clone, Copy)]
pub struct DailyLayout {
    pub student_name: usize,
    pub minutes: usize,
    pub teacher: Option<usize>,
}

pub fn resolve_daily(headers: &StringRecord) -> Result<DailyLayout, String> {
    let flags = detect(headers);
    if flags.has_raised && flags.has_sponsors {
        return Err(
            "This file looks like a cumulative stats export (it has Raised and Sponsors \
             columns). Upload it as a cumulative stats file instead."
                .to_string(),
        );
    }
    let Some(student_name) = find_column(headers, STUDENT_NAME_COLUMNS) else {
        return Err(missing("student name", STUDENT_NAME_COLUMNS));
    };
    let Some(minutes) = find_column(headers, MINUTES_COLUMNS) else {
        return Err(missing("minutes", MINUTES_COLUMNS));
    };
    Ok(DailyLayout {
        student_name,
        minutes,
        teacher: find_column(headers, TEACHER_COLUMNS),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct CumulativeLayout {
    pub student_name: usize,
    pub teacher: usize,
    pub raised: usize,
    pub sponsors: usize,
    pub minutes: usize,
}

pub fn resolve_cumulative(headers: &StringRecord) -> Result<CumulativeLayout, String> {
    let flags = detect(headers);
    if flags.has_student_name && flags.has_minutes && !flags.has_raised && !flags.has_sponsors {
        return Err(
            "This file looks like a daily minutes file (student and minutes columns, no \
             Raised or Sponsors). Upload it as a daily minutes file instead."
                .to_string(),
        );
    }
    let mut missing_fields = Vec::new();
    if !flags.has_student_name {
        missing_fields.push("student name");
    }
    if !flags.has_teacher {
        missing_fields.push("teacher");
    }
    if !flags.has_raised {
        missing_fields.push("raised");
    }
    if !flags.has_sponsors {
        missing_fields.push("sponsors");
    }
    if !flags.has_minutes {
        missing_fields.push("minutes");
    }
    if !missing_fields.is_empty() {
        return Err(format!(
            "Cumulative stats upload requires student name, teacher, raised, sponsors and \
             minutes columns; missing: {}",
            missing_fields.join(", ")
        ));
    }
    // All five are present; the finds below cannot fail.
    Ok(CumulativeLayout {
        student_name: find_column(headers, STUDENT_NAME_COLUMNS).unwrap_or(0),
        teacher: find_column(headers, TEACHER_COLUMNS).unwrap_or(0),
        raised: find_column(headers, RAISED_COLUMNS).unwrap_or(0),
        sponsors: find_column(headers, SPONSORS_COLUMNS).unwrap_or(0),
        minutes: find_column(headers, MINUTES_COLUMNS).unwrap_or(0),
    })
}

fn find_exact(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| norm(h) == name)
}

fn resolve_exact(headers: &StringRecord, required: &[&str], kind: &str) -> Result<Vec<usize>, String> {
    let mut idx = Vec::with_capacity(required.len());
    let mut missing_fields = Vec::new();
    for name in required {
        match find_exact(headers, name) {
            Some(i) => idx.push(i),
            None => missing_fields.push(*name),
        }
    }
    if !missing_fields.is_empty() {
        return Err(format!(
            "{} upload requires columns {}; missing: {}",
            kind,
            required.join(", "),
            missing_fields.join(", ")
        ));
    }
    Ok(idx)
}

#[derive(Debug, Clone, Copy)]
pub struct RosterLayout {
    pub student_name: usize,
    pub class_name: usize,
    pub home_room: usize,
    pub teacher_name: usize,
    pub grade_level: usize,
    pub team_name: usize,
}

pub fn resolve_roster(headers: &StringRecord) -> Result<RosterLayout, String> {
    let idx = resolve_exact(
        headers,
        &[
            "student_name",
            "class_name",
            "home_room",
            "teacher_name",
            "grade_level",
            "team_name",
        ],
        "Roster",
    )?;
    Ok(RosterLayout {
        student_name: idx[0],
        class_name: idx[1],
        home_room: idx[2],
        teacher_name: idx[3],
        grade_level: idx[4],
        team_name: idx[5],
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ClassInfoLayout {
    pub class_name: usize,
    pub home_room: usize,
    pub teacher_name: usize,
    pub grade_level: usize,
    pub team_name: usize,
    pub total_students: usize,
}

pub fn resolve_class_info(headers: &StringRecord) -> Result<ClassInfoLayout, String> {
    let idx = resolve_exact(
        headers,
        &[
            "class_name",
            "home_room",
            "teacher_name",
            "grade_level",
            "team_name",
            "total_students",
        ],
        "Class info",
    )?;
    Ok(ClassInfoLayout {
        class_name: idx[0],
        home_room: idx[1],
        teacher_name: idx[2],
        grade_level: idx[3],
        team_name: idx[4],
        total_students: idx[5],
    })
}

#[derive(Debug, Clone, Copy)]
pub struct GradeRulesLayout {
    pub grade_level: usize,
    pub min_daily_minutes: usize,
    pub max_daily_minutes_credit: usize,
}

pub fn resolve_grade_rules(headers: &StringRecord) -> Result<GradeRulesLayout, String> {
    let idx = resolve_exact(
        headers,
        &["grade_level", "min_daily_minutes", "max_daily_minutes_credit"],
        "Grade rules",
    )?;
    Ok(GradeRulesLayout {
        grade_level: idx[0],
        min_daily_minutes: idx[1],
        max_daily_minutes_credit: idx[2],
    })
}

/// Color-bonus files carry timestamp and grade_level columns too; both are
/// ignored, so only the three used columns are resolved.
#[derive(Debug, Clone, Copy)]
pub struct ColorBonusLayout {
    pub class_name: usize,
    pub team_name: usize,
    pub students_count: usize,
}

pub fn resolve_color_bonus(headers: &StringRecord) -> Result<ColorBonusLayout, String> {
    let idx = resolve_exact(
        headers,
        &["class_name", "team_name", "students_count"],
        "Team color bonus",
    )?;
    Ok(ColorBonusLayout {
        class_name: idx[0],
        team_name: idx[1],
        students_count: idx[2],
    })
}

/// Cell access that treats a missing field as empty; csv pads short rows
/// only when flexible parsing is on, so indexes can run past the record.
pub fn cell<'r>(record: &'r StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or("")
}
