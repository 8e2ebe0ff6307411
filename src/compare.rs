use rusqlite::Connection;
use serde::Serialize;

use crate::stats::{
    self, format_name_list, group_metric_value, round1, student_metric_value, GroupRollup,
    StatsError, StudentRollup,
};

pub struct MetricDef {
    pub key: &'static str,
    pub label: &'static str,
    pub format: &'static str,
    pub honors_filter: bool,
}

pub const METRICS: [MetricDef; 10] = [
    MetricDef { key: "total_minutes", label: "Total Minutes (Capped)", format: "minutes", honors_filter: true },
    MetricDef { key: "total_minutes_raw", label: "Total Minutes (Raw)", format: "minutes", honors_filter: true },
    MetricDef { key: "avg_daily_minutes", label: "Average Daily Minutes", format: "minutes", honors_filter: true },
    MetricDef { key: "participation_rate", label: "Participation Rate", format: "percent", honors_filter: true },
    MetricDef { key: "reading_days", label: "Reading Days", format: "count", honors_filter: true },
    MetricDef { key: "goal_met_any_pct", label: "Goal Met (Any Day)", format: "percent", honors_filter: true },
    MetricDef { key: "goal_met_all_pct", label: "Goal Met (Every Day)", format: "percent", honors_filter: true },
    MetricDef { key: "total_raised", label: "Total Raised", format: "currency", honors_filter: false },
    MetricDef { key: "total_sponsors", label: "Total Sponsors", format: "count", honors_filter: false },
    MetricDef { key: "color_points", label: "Color War Points", format: "count", honors_filter: true },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    School,
    Team,
    Grade,
    Class,
    Student,
}

const LEVELS: [Level; 5] = [
    Level::School,
    Level::Team,
    Level::Grade,
    Level::Class,
    Level::Student,
];

impl Level {
    fn name(self) -> &'static str {
        match self {
            Level::School => "School",
            Level::Team => "Team",
            Level::Grade => "Grade",
            Level::Class => "Class",
            Level::Student => "Student",
        }
    }

    fn group_by(self) -> Option<stats::GroupBy> {
        match self {
            Level::School => Some(stats::GroupBy::School),
            Level::Team => Some(stats::GroupBy::Team),
            Level::Grade => Some(stats::GroupBy::Grade),
            Level::Class => Some(stats::GroupBy::Class),
            Level::Student => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub absolute: f64,
    pub direction: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRow {
    pub entity_level: String,
    pub metric: String,
    pub label: String,
    pub honors_filter: bool,
    pub db1_value: Option<f64>,
    pub db2_value: Option<f64>,
    pub db1_holders: String,
    pub db2_holders: String,
    pub change: Option<Change>,
    pub winner: Option<String>,
    pub format: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport {
    pub day: Option<i64>,
    pub db1_label: String,
    pub db2_label: String,
    pub db1_day_date: Option<String>,
    pub db2_day_date: Option<String>,
    pub rows: Vec<ComparisonRow>,
}

// "Day N" is relative to each database's own calendar: its Nth distinct
// log date, ascending. The same N can resolve to different dates per side.
enum DayResolution {
    Full,
    On(String),
    OutOfRange,
}

fn resolve_day(conn: &Connection, day: Option<i64>) -> Result<DayResolution, StatsError> {
    let Some(n) = day else {
        return Ok(DayResolution::Full);
    };
    if n < 1 {
        return Ok(DayResolution::OutOfRange);
    }
    let days = stats::contest_days(conn)?;
    Ok(match days.get((n - 1) as usize) {
        Some(d) => DayResolution::On(d.clone()),
        None => DayResolution::OutOfRange,
    })
}

enum LevelData {
    Groups(Vec<GroupRollup>),
    Students(Vec<StudentRollup>),
}

struct LevelSide {
    data: LevelData,
    minutes_valid: bool,
}

fn level_side(
    conn: &Connection,
    level: Level,
    resolution: &DayResolution,
) -> Result<LevelSide, StatsError> {
    // An out-of-range day still needs rollups: money metrics ignore the
    // filter, so they read from the unfiltered table.
    let (date, minutes_valid) = match resolution {
        DayResolution::Full => (None, true),
        DayResolution::On(d) => (Some(d.as_str()), true),
        DayResolution::OutOfRange => (None, false),
    };
    let data = match level.group_by() {
        Some(gb) => LevelData::Groups(stats::summary(conn, gb, date)?),
        None => LevelData::Students(stats::students(conn, date)?),
    };
    Ok(LevelSide { data, minutes_valid })
}

impl LevelSide {
    /// Best entity value for the metric with tie-aware holder names, or
    /// None when the day filter ruled this side out (or no entities exist).
    fn best(&self, metric: &MetricDef) -> (Option<f64>, String) {
        if metric.honors_filter && !self.minutes_valid {
            return (None, String::new());
        }
        let candidates: Vec<(String, f64)> = match &self.data {
            LevelData::Groups(rollups) => rollups
                .iter()
                .filter_map(|r| {
                    group_metric_value(r, metric.key).map(|v| (r.group_key.clone(), v))
                })
                .collect(),
            LevelData::Students(rollups) => rollups
                .iter()
                .filter_map(|r| {
                    student_metric_value(r, metric.key).map(|v| (r.student_name.clone(), v))
                })
                .collect(),
        };
        if candidates.is_empty() {
            return (None, String::new());
        }
        let max = candidates
            .iter()
            .map(|(_, v)| *v)
            .fold(f64::NEG_INFINITY, f64::max);
        let holders: Vec<String> = candidates
            .iter()
            .filter(|(_, v)| *v == max)
            .map(|(name, _)| name.clone())
            .collect();
        (Some(max), format_name_list(&holders))
    }
}

fn compare_values(v1: Option<f64>, v2: Option<f64>) -> (Option<Change>, Option<String>) {
    let (Some(a), Some(b)) = (v1, v2) else {
        return (None, None);
    };
    let absolute = round1(b - a);
    let direction = if b > a {
        "up"
    } else if b < a {
        "down"
    } else {
        "same"
    };
    let winner = if a > b {
        "db1"
    } else if b > a {
        "db2"
    } else {
        "tie"
    };
    (
        Some(Change {
            absolute,
            direction: direction.to_string(),
        }),
        Some(winner.to_string()),
    )
}

pub fn run(
    db1: &Connection,
    db2: &Connection,
    db1_label: &str,
    db2_label: &str,
    day: Option<i64>,
) -> Result<ComparisonReport, StatsError> {
    let res1 = resolve_day(db1, day)?;
    let res2 = resolve_day(db2, day)?;

    let mut rows = Vec::new();
    for level in LEVELS {
        let side1 = level_side(db1, level, &res1)?;
        let side2 = level_side(db2, level, &res2)?;
        for metric in &METRICS {
            // Color War Points attach to classes, never to one student.
            if level == Level::Student && metric.key == "color_points" {
                continue;
            }
            let (db1_value, db1_holders) = side1.best(metric);
            let (db2_value, db2_holders) = side2.best(metric);
            let (change, winner) = compare_values(db1_value, db2_value);
            rows.push(ComparisonRow {
                entity_level: level.name().to_string(),
                metric: metric.key.to_string(),
                label: metric.label.to_string(),
                honors_filter: metric.honors_filter,
                db1_value,
                db2_value,
                db1_holders,
                db2_holders,
                change,
                winner,
                format: metric.format.to_string(),
            });
        }
    }

    Ok(ComparisonReport {
        day,
        db1_label: db1_label.to_string(),
        db2_label: db2_label.to_string(),
        db1_day_date: match &res1 {
            DayResolution::On(d) => Some(d.clone()),
            _ => None,
        },
        db2_day_date: match &res2 {
            DayResolution::On(d) => Some(d.clone()),
            _ => None,
        },
        rows,
    })
}
