use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;

use crate::columns::norm;

/// Daily credit cap applied by every rollup. Deliberately independent of
/// grade_rules.max_daily_minutes_credit, which is stored but not consulted.
pub const DAILY_MINUTES_CAP: i64 = 120;

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsError {
    pub code: String,
    pub message: String,
}

impl StatsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StatsError {
    fn from(e: rusqlite::Error) -> Self {
        StatsError::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Class,
    Team,
    Grade,
    School,
}

impl GroupBy {
    pub fn parse(raw: &str) -> Option<GroupBy> {
        match norm(raw).as_str() {
            "class" => Some(GroupBy::Class),
            "team" => Some(GroupBy::Team),
            "grade" => Some(GroupBy::Grade),
            "school" => Some(GroupBy::School),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRollup {
    pub group_key: String,
    pub grade_level: Option<i64>,
    pub grade_label: String,
    pub student_count: i64,
    pub contest_days: i64,
    pub total_minutes: i64,
    pub total_minutes_raw: i64,
    pub total_minutes_with_bonus: i64,
    pub avg_daily_minutes: f64,
    pub participating_pairs: i64,
    pub participation_rate: f64,
    pub participation_with_color: f64,
    pub color_points: i64,
    pub reading_days: i64,
    pub goal_met_any_pct: f64,
    pub goal_met_all_pct: f64,
    pub total_raised: f64,
    pub total_sponsors: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRollup {
    pub student_name: String,
    pub class_name: String,
    pub grade_level: i64,
    pub team_name: String,
    pub contest_days: i64,
    pub days_participated: i64,
    pub total_minutes: i64,
    pub total_minutes_raw: i64,
    pub avg_daily_minutes: f64,
    pub participation_rate: f64,
    pub goal_met_days: i64,
    pub met_goal_any: bool,
    pub met_goal_all: bool,
    pub donation_amount: f64,
    pub sponsors: i64,
}

struct RosterStudent {
    name: String,
    norm_name: String,
    grade: i64,
    class_name: String,
    class_norm: String,
    team_name: String,
    team_norm: String,
}

struct ClassFacts {
    display: String,
    team_name: String,
    team_norm: String,
    grade: Option<i64>,
    bonus_minutes: i64,
    bonus_points: i64,
}

struct CumeRow {
    norm_name: String,
    raised: f64,
    sponsors: i64,
    team_name: String,
}

fn load_roster_students(conn: &Connection) -> Result<Vec<RosterStudent>, StatsError> {
    let mut stmt = conn.prepare(
        "SELECT student_name, grade_level, class_name, team_name FROM roster ORDER BY student_name",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(name, grade, class_name, team_name)| RosterStudent {
            norm_name: norm(&name),
            class_norm: norm(&class_name),
            team_norm: norm(&team_name),
            name,
            grade,
            class_name,
            team_name,
        })
        .collect())
}

fn load_grade_rules(conn: &Connection) -> Result<HashMap<i64, i64>, StatsError> {
    let mut stmt = conn.prepare("SELECT grade_level, min_daily_minutes FROM grade_rules")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

// student norm -> date -> raw minutes for that day
type MinutesByStudent = HashMap<String, BTreeMap<String, i64>>;

fn load_minutes(conn: &Connection, date: Option<&str>) -> Result<MinutesByStudent, StatsError> {
    let mut map: MinutesByStudent = HashMap::new();
    let mut add = |name: String, log_date: String, minutes: i64| {
        *map.entry(norm(&name))
            .or_default()
            .entry(log_date)
            .or_insert(0) += minutes;
    };
    match date {
        Some(d) => {
            let mut stmt = conn.prepare(
                "SELECT student_name, log_date, minutes_read FROM daily_logs WHERE log_date = ?",
            )?;
            let rows = stmt
                .query_map([d], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (name, log_date, minutes) in rows {
                add(name, log_date, minutes);
            }
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT student_name, log_date, minutes_read FROM daily_logs")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (name, log_date, minutes) in rows {
                add(name, log_date, minutes);
            }
        }
    }
    Ok(map)
}

/// Distinct contest dates, ascending. The denominator for participation is
/// this list's length, or 1 when a single-date filter is in play.
pub fn contest_days(conn: &Connection) -> Result<Vec<String>, StatsError> {
    let mut stmt = conn.prepare("SELECT DISTINCT log_date FROM daily_logs ORDER BY log_date")?;
    let days = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(days)
}

fn load_class_facts(conn: &Connection, date: Option<&str>) -> Result<HashMap<String, ClassFacts>, StatsError> {
    let mut facts: HashMap<String, ClassFacts> = HashMap::new();
    let mut stmt =
        conn.prepare("SELECT class_name, team_name, grade_level FROM class_info")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (class_name, team_name, grade) in rows {
        facts.insert(
            norm(&class_name),
            ClassFacts {
                display: class_name,
                team_norm: norm(&team_name),
                team_name,
                grade: Some(grade),
                bonus_minutes: 0,
                bonus_points: 0,
            },
        );
    }

    // The color-bonus table is minutes-shaped data, so it honors the filter.
    let bonus_rows: Vec<(String, String, i64, i64)> = match date {
        Some(d) => {
            let mut stmt = conn.prepare(
                "SELECT class_name, team_name, bonus_minutes, bonus_participation_points
                 FROM team_color_bonus WHERE event_date = ?",
            )?;
            let rows = stmt
                .query_map([d], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT class_name, team_name, bonus_minutes, bonus_participation_points
                 FROM team_color_bonus",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    for (class_name, team_name, minutes, points) in bonus_rows {
        let entry = facts.entry(norm(&class_name)).or_insert_with(|| ClassFacts {
            display: class_name,
            team_norm: norm(&team_name),
            team_name,
            grade: None,
            bonus_minutes: 0,
            bonus_points: 0,
        });
        entry.bonus_minutes += minutes;
        entry.bonus_points += points;
    }
    Ok(facts)
}

fn load_cumulative(conn: &Connection) -> Result<Vec<CumeRow>, StatsError> {
    let mut stmt = conn.prepare(
        "SELECT student_name, donation_amount, sponsors, team_name FROM reader_cumulative",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(name, raised, sponsors, team_name)| CumeRow {
            norm_name: norm(&name),
            raised,
            sponsors,
            team_name,
        })
        .collect())
}

struct GroupAccum {
    display: String,
    grades: Vec<i64>,
    student_norms: Vec<String>,
    student_grades: Vec<i64>,
    bonus_minutes: i64,
    bonus_points: i64,
    total_raised: f64,
    total_sponsors: i64,
}

impl GroupAccum {
    fn new(display: String) -> Self {
        GroupAccum {
            display,
            grades: Vec::new(),
            student_norms: Vec::new(),
            student_grades: Vec::new(),
            bonus_minutes: 0,
            bonus_points: 0,
            total_raised: 0.0,
            total_sponsors: 0,
        }
    }
}

pub fn summary(
    conn: &Connection,
    group_by: GroupBy,
    date: Option<&str>,
) -> Result<Vec<GroupRollup>, StatsError> {
    let roster = load_roster_students(conn)?;
    let rules = load_grade_rules(conn)?;
    let minutes = load_minutes(conn, date)?;
    let facts = load_class_facts(conn, date)?;
    let cume = load_cumulative(conn)?;
    let days = match date {
        Some(_) => 1,
        None => contest_days(conn)?.len() as i64,
    };

    // roster student norm -> (class_norm, grade) for money attribution
    let student_group: HashMap<&str, (&str, i64)> = roster
        .iter()
        .map(|s| (s.norm_name.as_str(), (s.class_norm.as_str(), s.grade)))
        .collect();

    let mut groups: BTreeMap<String, GroupAccum> = BTreeMap::new();
    let key_for = |s: &RosterStudent| -> (String, String) {
        match group_by {
            GroupBy::Class => {
                let display = facts
                    .get(&s.class_norm)
                    .map(|f| f.display.clone())
                    .unwrap_or_else(|| s.class_name.clone());
                (s.class_norm.clone(), display)
            }
            GroupBy::Team => (s.team_norm.clone(), s.team_name.clone()),
            GroupBy::Grade => (grade_key(s.grade), s.grade.to_string()),
            GroupBy::School => ("school".to_string(), "School".to_string()),
        }
    };

    for s in &roster {
        let (key, display) = key_for(s);
        let g = groups.entry(key).or_insert_with(|| GroupAccum::new(display));
        g.student_norms.push(s.norm_name.clone());
        g.student_grades.push(s.grade);
        g.grades.push(s.grade);
    }

    // Canonical team casing comes from class_info when it has the team.
    if group_by == GroupBy::Team {
        for f in facts.values() {
            if let Some(g) = groups.get_mut(&f.team_norm) {
                g.display = f.team_name.clone();
            }
        }
    }

    // Color bonuses attach at class granularity and roll up from there.
    for (class_norm, f) in &facts {
        if f.bonus_minutes == 0 && f.bonus_points == 0 {
            continue;
        }
        let key = match group_by {
            GroupBy::Class => Some(class_norm.clone()),
            GroupBy::Team => Some(f.team_norm.clone()),
            GroupBy::Grade => f.grade.map(grade_key),
            GroupBy::School => Some("school".to_string()),
        };
        let Some(key) = key else { continue };
        let g = groups.entry(key).or_insert_with(|| match group_by {
            GroupBy::Class => GroupAccum::new(f.display.clone()),
            GroupBy::Team => GroupAccum::new(f.team_name.clone()),
            GroupBy::Grade => GroupAccum::new(
                f.grade.map(|g| g.to_string()).unwrap_or_default(),
            ),
            GroupBy::School => GroupAccum::new("School".to_string()),
        });
        g.bonus_minutes += f.bonus_minutes;
        g.bonus_points += f.bonus_points;
    }

    // Fundraising is never date-filtered. Team money follows the snapshot
    // team column, so the sentinel team surfaces as its own group.
    for row in &cume {
        let key = match group_by {
            GroupBy::School => Some(("school".to_string(), "School".to_string())),
            GroupBy::Team => Some((norm(&row.team_name), row.team_name.clone())),
            GroupBy::Class => student_group
                .get(row.norm_name.as_str())
                .map(|(class_norm, _)| {
                    let display = facts
                        .get(*class_norm)
                        .map(|f| f.display.clone())
                        .unwrap_or_else(|| (*class_norm).to_string());
                    ((*class_norm).to_string(), display)
                }),
            GroupBy::Grade => student_group
                .get(row.norm_name.as_str())
                .map(|(_, grade)| (grade_key(*grade), grade.to_string())),
        };
        let Some((key, display)) = key else { continue };
        let g = groups.entry(key).or_insert_with(|| GroupAccum::new(display));
        g.total_raised += row.raised;
        g.total_sponsors += row.sponsors;
    }

    let mut out = Vec::with_capacity(groups.len());
    for g in groups.into_values() {
        out.push(finish_group(&g, &minutes, &rules, days));
    }
    Ok(out)
}

// Zero-padded so BTreeMap iteration stays in numeric grade order.
fn grade_key(grade: i64) -> String {
    format!("grade:{:04}", grade)
}

fn finish_group(
    g: &GroupAccum,
    minutes: &MinutesByStudent,
    rules: &HashMap<i64, i64>,
    days: i64,
) -> GroupRollup {
    let student_count = g.student_norms.len() as i64;
    let mut pairs = 0i64;
    let mut total_raw = 0i64;
    let mut total_capped = 0i64;
    let mut reading_dates: HashSet<&str> = HashSet::new();
    let mut any_goal = 0i64;
    let mut all_goal = 0i64;

    for (norm_name, grade) in g.student_norms.iter().zip(&g.student_grades) {
        let Some(by_date) = minutes.get(norm_name) else {
            continue;
        };
        let goal_min = rules.get(grade).copied();
        let mut goal_days = 0i64;
        for (date, raw) in by_date {
            total_raw += raw;
            total_capped += (*raw).min(DAILY_MINUTES_CAP);
            if *raw > 0 {
                pairs += 1;
                reading_dates.insert(date.as_str());
            }
            if let Some(min_daily) = goal_min {
                if *raw >= min_daily {
                    goal_days += 1;
                }
            }
        }
        if goal_days >= 1 {
            any_goal += 1;
        }
        if days > 0 && goal_days == days && by_date.len() as i64 == days {
            all_goal += 1;
        }
    }

    let denom = (student_count * days) as f64;
    let participation_rate = if denom > 0.0 {
        round1(100.0 * pairs as f64 / denom)
    } else {
        0.0
    };
    let participation_with_color = if denom > 0.0 {
        round1(100.0 * (pairs + g.bonus_points) as f64 / denom)
    } else {
        0.0
    };
    let avg_daily_minutes = if denom > 0.0 {
        round1(total_capped as f64 / denom)
    } else {
        0.0
    };
    let goal_met_any_pct = if student_count > 0 {
        round1(100.0 * any_goal as f64 / student_count as f64)
    } else {
        0.0
    };
    let goal_met_all_pct = if student_count > 0 {
        round1(100.0 * all_goal as f64 / student_count as f64)
    } else {
        0.0
    };

    let grade_level = uniform_grade(&g.grades);
    GroupRollup {
        group_key: g.display.clone(),
        grade_level,
        grade_label: grade_label_for(grade_level),
        student_count,
        contest_days: days,
        total_minutes: total_capped,
        total_minutes_raw: total_raw,
        total_minutes_with_bonus: total_capped + g.bonus_minutes,
        avg_daily_minutes,
        participating_pairs: pairs,
        participation_rate,
        participation_with_color,
        color_points: g.bonus_points,
        reading_days: reading_dates.len() as i64,
        goal_met_any_pct,
        goal_met_all_pct,
        total_raised: g.total_raised,
        total_sponsors: g.total_sponsors,
    }
}

fn uniform_grade(grades: &[i64]) -> Option<i64> {
    let first = *grades.first()?;
    grades.iter().all(|g| *g == first).then_some(first)
}

pub fn grade_label_for(grade: Option<i64>) -> String {
    match grade {
        Some(g) => g.to_string(),
        None => "Various".to_string(),
    }
}

pub fn students(conn: &Connection, date: Option<&str>) -> Result<Vec<StudentRollup>, StatsError> {
    let roster = load_roster_students(conn)?;
    let rules = load_grade_rules(conn)?;
    let minutes = load_minutes(conn, date)?;
    let days = match date {
        Some(_) => 1,
        None => contest_days(conn)?.len() as i64,
    };
    let cume: HashMap<String, (f64, i64)> = load_cumulative(conn)?
        .into_iter()
        .map(|r| (r.norm_name, (r.raised, r.sponsors)))
        .collect();

    let mut out = Vec::with_capacity(roster.len());
    for s in &roster {
        let mut days_participated = 0i64;
        let mut total_raw = 0i64;
        let mut total_capped = 0i64;
        let mut goal_days = 0i64;
        let mut days_with_data = 0i64;
        let goal_min = rules.get(&s.grade).copied();
        if let Some(by_date) = minutes.get(&s.norm_name) {
            for raw in by_date.values() {
                days_with_data += 1;
                total_raw += raw;
                total_capped += (*raw).min(DAILY_MINUTES_CAP);
                if *raw > 0 {
                    days_participated += 1;
                }
                if let Some(min_daily) = goal_min {
                    if *raw >= min_daily {
                        goal_days += 1;
                    }
                }
            }
        }
        let (donation_amount, sponsors) = cume
            .get(&s.norm_name)
            .copied()
            .unwrap_or((0.0, 0));
        let participation_rate = if days > 0 {
            round1(100.0 * days_participated as f64 / days as f64)
        } else {
            0.0
        };
        let avg_daily_minutes = if days > 0 {
            round1(total_capped as f64 / days as f64)
        } else {
            0.0
        };
        out.push(StudentRollup {
            student_name: s.name.clone(),
            class_name: s.class_name.clone(),
            grade_level: s.grade,
            team_name: s.team_name.clone(),
            contest_days: days,
            days_participated,
            total_minutes: total_capped,
            total_minutes_raw: total_raw,
            avg_daily_minutes,
            participation_rate,
            goal_met_days: goal_days,
            met_goal_any: goal_days >= 1,
            met_goal_all: days > 0 && goal_days == days && days_with_data == days,
            donation_amount,
            sponsors,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tie-aware winners

#[derive(Debug, Clone)]
pub struct WinnerCandidate {
    pub name: String,
    pub grade: Option<i64>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerResult {
    pub metric: String,
    pub value: f64,
    pub winners: Vec<String>,
    pub display: String,
    pub grade_label: String,
}

/// Every candidate whose value equals the maximum wins; ties are never
/// broken by ordering.
pub fn select_winners(metric: &str, candidates: &[WinnerCandidate]) -> WinnerResult {
    let max = candidates
        .iter()
        .map(|c| c.value)
        .fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<&WinnerCandidate> = if candidates.is_empty() {
        Vec::new()
    } else {
        candidates.iter().filter(|c| c.value == max).collect()
    };
    let names: Vec<String> = tied.iter().map(|c| c.name.clone()).collect();
    let grades: Vec<Option<i64>> = tied.iter().map(|c| c.grade).collect();
    WinnerResult {
        metric: metric.to_string(),
        value: if tied.is_empty() { 0.0 } else { max },
        display: format_name_list(&names),
        winners: names,
        grade_label: combined_grade_label(&grades),
    }
}

pub fn format_name_list(names: &[String]) -> String {
    match names.len() {
        0 => String::new(),
        1 => names[0].clone(),
        2..=4 => names.join(", "),
        n => format!("{} and {} others", names[..3].join(", "), n - 3),
    }
}

fn combined_grade_label(grades: &[Option<i64>]) -> String {
    let mut iter = grades.iter();
    let Some(first) = iter.next().copied().flatten() else {
        return "Various".to_string();
    };
    if grades.iter().all(|g| *g == Some(first)) {
        first.to_string()
    } else {
        "Various".to_string()
    }
}

pub fn group_metric_value(r: &GroupRollup, metric: &str) -> Option<f64> {
    match metric {
        "total_minutes" => Some(r.total_minutes as f64),
        "total_minutes_raw" => Some(r.total_minutes_raw as f64),
        "total_minutes_with_bonus" => Some(r.total_minutes_with_bonus as f64),
        "avg_daily_minutes" => Some(r.avg_daily_minutes),
        "participation_rate" => Some(r.participation_rate),
        "participation_with_color" => Some(r.participation_with_color),
        "reading_days" => Some(r.reading_days as f64),
        "goal_met_any_pct" => Some(r.goal_met_any_pct),
        "goal_met_all_pct" => Some(r.goal_met_all_pct),
        "total_raised" => Some(r.total_raised),
        "total_sponsors" => Some(r.total_sponsors as f64),
        "color_points" => Some(r.color_points as f64),
        _ => None,
    }
}

pub fn is_group_metric(key: &str) -> bool {
    matches!(
        key,
        "total_minutes"
            | "total_minutes_raw"
            | "total_minutes_with_bonus"
            | "avg_daily_minutes"
            | "participation_rate"
            | "participation_with_color"
            | "reading_days"
            | "goal_met_any_pct"
            | "goal_met_all_pct"
            | "total_raised"
            | "total_sponsors"
            | "color_points"
    )
}

pub fn is_student_metric(key: &str) -> bool {
    matches!(
        key,
        "total_minutes"
            | "total_minutes_raw"
            | "avg_daily_minutes"
            | "participation_rate"
            | "reading_days"
            | "goal_met_any_pct"
            | "goal_met_all_pct"
            | "total_raised"
            | "total_sponsors"
    )
}

pub fn student_metric_value(r: &StudentRollup, metric: &str) -> Option<f64> {
    match metric {
        "total_minutes" => Some(r.total_minutes as f64),
        "total_minutes_raw" => Some(r.total_minutes_raw as f64),
        "avg_daily_minutes" => Some(r.avg_daily_minutes),
        "participation_rate" => Some(r.participation_rate),
        "reading_days" => Some(r.days_participated as f64),
        "goal_met_any_pct" => Some(if r.met_goal_any { 100.0 } else { 0.0 }),
        "goal_met_all_pct" => Some(if r.met_goal_all { 100.0 } else { 0.0 }),
        "total_raised" => Some(r.donation_amount),
        "total_sponsors" => Some(r.sponsors as f64),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeWinners {
    pub grade_level: i64,
    pub metric: String,
    pub value: f64,
    pub winners: Vec<String>,
    pub display: String,
}

/// Per-grade winner boards: the tie-aware winner among each grade's students.
pub fn grade_winners(
    conn: &Connection,
    metric: &str,
    date: Option<&str>,
) -> Result<Vec<GradeWinners>, StatsError> {
    let rollups = students(conn, date)?;
    if !rollups.is_empty() && student_metric_value(&rollups[0], metric).is_none() {
        return Err(StatsError::new(
            "bad_params",
            format!("unknown student metric: {}", metric),
        ));
    }
    let mut by_grade: BTreeMap<i64, Vec<WinnerCandidate>> = BTreeMap::new();
    for r in &rollups {
        let Some(value) = student_metric_value(r, metric) else {
            continue;
        };
        by_grade
            .entry(r.grade_level)
            .or_default()
            .push(WinnerCandidate {
                name: r.student_name.clone(),
                grade: Some(r.grade_level),
                value,
            });
    }
    Ok(by_grade
        .into_iter()
        .map(|(grade_level, candidates)| {
            let w = select_winners(metric, &candidates);
            GradeWinners {
                grade_level,
                metric: w.metric,
                value: w.value,
                winners: w.winners,
                display: w.display,
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Integrity report

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityFinding {
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub findings: Vec<IntegrityFinding>,
    pub roster_students: i64,
    pub classes_in_roster: i64,
    pub classes_registered: i64,
}

/// Advisory cross-checks between roster, class_info, grade_rules and the
/// uploaded contest data. Never blocks an upload.
pub fn integrity_report(conn: &Connection) -> Result<IntegrityReport, StatsError> {
    let roster = load_roster_students(conn)?;
    let rules = load_grade_rules(conn)?;
    let mut findings = Vec::new();

    let mut class_sizes: HashMap<String, (String, i64)> = HashMap::new();
    for s in &roster {
        let entry = class_sizes
            .entry(s.class_norm.clone())
            .or_insert_with(|| (s.class_name.clone(), 0));
        entry.1 += 1;
    }

    struct RegisteredClass {
        display: String,
        team_norm: String,
        team_name: String,
        total_students: i64,
    }
    let mut registered: HashMap<String, RegisteredClass> = HashMap::new();
    {
        let mut stmt =
            conn.prepare("SELECT class_name, team_name, total_students FROM class_info")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (class_name, team_name, total_students) in rows {
            registered.insert(
                norm(&class_name),
                RegisteredClass {
                    display: class_name,
                    team_norm: norm(&team_name),
                    team_name,
                    total_students,
                },
            );
        }
    }

    let mut roster_class_norms: Vec<&String> = class_sizes.keys().collect();
    roster_class_norms.sort();
    for class_norm in &roster_class_norms {
        let (display, count) = &class_sizes[*class_norm];
        match registered.get(*class_norm) {
            None => findings.push(IntegrityFinding {
                category: "class_missing_in_class_info".to_string(),
                message: format!("Class '{}' appears in roster but not in class info", display),
            }),
            Some(reg) if reg.total_students != *count => findings.push(IntegrityFinding {
                category: "class_size_mismatch".to_string(),
                message: format!(
                    "Class '{}' lists {} students in class info but roster has {}",
                    reg.display, reg.total_students, count
                ),
            }),
            Some(_) => {}
        }
    }
    let mut registered_norms: Vec<&String> = registered.keys().collect();
    registered_norms.sort();
    for class_norm in &registered_norms {
        if !class_sizes.contains_key(*class_norm) {
            findings.push(IntegrityFinding {
                category: "class_missing_in_roster".to_string(),
                message: format!(
                    "Class '{}' is registered in class info but has no roster students",
                    registered[*class_norm].display
                ),
            });
        }
    }

    for s in &roster {
        if let Some(reg) = registered.get(&s.class_norm) {
            if s.team_norm != reg.team_norm {
                findings.push(IntegrityFinding {
                    category: "team_mismatch".to_string(),
                    message: format!(
                        "Student '{}' has team '{}' but class '{}' is registered to team '{}'",
                        s.name, s.team_name, reg.display, reg.team_name
                    ),
                });
            }
        }
    }

    let mut grades: Vec<i64> = roster
        .iter()
        .map(|s| s.grade)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    grades.sort();
    for grade in grades {
        if !rules.contains_key(&grade) {
            findings.push(IntegrityFinding {
                category: "grade_rule_missing".to_string(),
                message: format!("Grade {} has roster students but no grade rule", grade),
            });
        }
    }

    let roster_norms: HashSet<&str> = roster.iter().map(|s| s.norm_name.as_str()).collect();
    {
        let mut stmt = conn.prepare("SELECT DISTINCT student_name FROM daily_logs ORDER BY student_name")?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for name in names {
            if !roster_norms.contains(norm(&name).as_str()) {
                findings.push(IntegrityFinding {
                    category: "orphan_daily_student".to_string(),
                    message: format!("Daily logs contain '{}' who is not in the roster", name),
                });
            }
        }
    }
    {
        let mut stmt = conn
            .prepare("SELECT DISTINCT student_name FROM reader_cumulative ORDER BY student_name")?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for name in names {
            if !roster_norms.contains(norm(&name).as_str()) {
                findings.push(IntegrityFinding {
                    category: "orphan_cumulative_student".to_string(),
                    message: format!(
                        "Cumulative stats contain '{}' who is not in the roster",
                        name
                    ),
                });
            }
        }
    }

    Ok(IntegrityReport {
        findings,
        roster_students: roster.len() as i64,
        classes_in_roster: class_sizes.len() as i64,
        classes_registered: registered.len() as i64,
    })
}
