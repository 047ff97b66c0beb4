use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Upper bound for `next_after`; covers a Feb 29 schedule from any start.
const SEARCH_HORIZON_MINUTES: i64 = 4 * 366 * 24 * 60;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("invalid {field} token '{token}'")]
    InvalidToken { field: &'static str, token: String },
    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("{field} step must be greater than zero")]
    ZeroStep { field: &'static str },
    #[error("lists are only supported in the day-of-week field, not {field}")]
    ListNotAllowed { field: &'static str },
}

#[derive(Debug, Clone, Copy)]
struct FieldRule {
    name: &'static str,
    min: u32,
    max: u32,
    allow_list: bool,
}

const MINUTE: FieldRule = FieldRule {
    name: "minute",
    min: 0,
    max: 59,
    allow_list: false,
};
const HOUR: FieldRule = FieldRule {
    name: "hour",
    min: 0,
    max: 23,
    allow_list: false,
};
const DAY_OF_MONTH: FieldRule = FieldRule {
    name: "day-of-month",
    min: 1,
    max: 31,
    allow_list: false,
};
const MONTH: FieldRule = FieldRule {
    name: "month",
    min: 1,
    max: 12,
    allow_list: false,
};
// 0 and 7 both mean Sunday.
const DAY_OF_WEEK: FieldRule = FieldRule {
    name: "day-of-week",
    min: 0,
    max: 7,
    allow_list: true,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSpec {
    Any,
    Exact(u32),
    /// `*/N`: every N-th value counted from the field minimum.
    Step(u32),
    List(Vec<u32>),
}

impl FieldSpec {
    fn parse(token: &str, rule: FieldRule) -> Result<Self, ScheduleError> {
        if token == "*" {
            return Ok(FieldSpec::Any);
        }
        if let Some(step) = token.strip_prefix("*/") {
            let step = parse_number(step, token, rule)?;
            if step == 0 {
                return Err(ScheduleError::ZeroStep { field: rule.name });
            }
            return Ok(FieldSpec::Step(step));
        }
        if token.contains(',') {
            if !rule.allow_list {
                return Err(ScheduleError::ListNotAllowed { field: rule.name });
            }
            let mut values = Vec::new();
            for part in token.split(',') {
                values.push(parse_value(part, token, rule)?);
            }
            return Ok(FieldSpec::List(values));
        }
        Ok(FieldSpec::Exact(parse_value(token, token, rule)?))
    }

    fn matches(&self, value: u32, rule: FieldRule) -> bool {
        match self {
            FieldSpec::Any => true,
            FieldSpec::Exact(v) => normalize(*v, rule) == value,
            FieldSpec::Step(step) => value >= rule.min && (value - rule.min) % step == 0,
            FieldSpec::List(values) => values.iter().any(|v| normalize(*v, rule) == value),
        }
    }

    fn is_restricted(&self) -> bool {
        !matches!(self, FieldSpec::Any)
    }
}

fn normalize(value: u32, rule: FieldRule) -> u32 {
    if rule.name == DAY_OF_WEEK.name && value == 7 {
        0
    } else {
        value
    }
}

fn parse_number(text: &str, token: &str, rule: FieldRule) -> Result<u32, ScheduleError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScheduleError::InvalidToken {
            field: rule.name,
            token: token.to_string(),
        });
    }
    text.parse::<u32>().map_err(|_| ScheduleError::InvalidToken {
        field: rule.name,
        token: token.to_string(),
    })
}

fn parse_value(text: &str, token: &str, rule: FieldRule) -> Result<u32, ScheduleError> {
    let value = parse_number(text, token, rule)?;
    if value < rule.min || value > rule.max {
        return Err(ScheduleError::OutOfRange {
            field: rule.name,
            value,
            min: rule.min,
            max: rule.max,
        });
    }
    Ok(value)
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: FieldSpec,
    hour: FieldSpec,
    day_of_month: FieldSpec,
    month: FieldSpec,
    day_of_week: FieldSpec,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: FieldSpec::parse(fields[0], MINUTE)?,
            hour: FieldSpec::parse(fields[1], HOUR)?,
            day_of_month: FieldSpec::parse(fields[2], DAY_OF_MONTH)?,
            month: FieldSpec::parse(fields[3], MONTH)?,
            day_of_week: FieldSpec::parse(fields[4], DAY_OF_WEEK)?,
        })
    }

    /// Whether the minute containing `at` is a firing minute. Seconds are
    /// ignored; the caller decides which timezone the fields are read in.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        if !self.minute.matches(at.minute(), MINUTE)
            || !self.hour.matches(at.hour(), HOUR)
            || !self.month.matches(at.month(), MONTH)
        {
            return false;
        }

        let dom = self.day_of_month.matches(at.day(), DAY_OF_MONTH);
        let dow = self
            .day_of_week
            .matches(at.weekday().num_days_from_sunday(), DAY_OF_WEEK);
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First firing minute strictly after `after`, read in `tz`.
    pub fn next_after<Tz: TimeZone>(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(after) + Duration::minutes(1);
        (0..SEARCH_HORIZON_MINUTES)
            .map(|offset| start + Duration::minutes(offset))
            .find(|candidate| self.matches(&candidate.with_timezone(tz)))
    }

    /// Short human-readable rendering used by the CLI.
    pub fn describe(&self) -> String {
        let time = match (&self.minute, &self.hour) {
            (FieldSpec::Exact(m), FieldSpec::Exact(h)) => format!("at {:02}:{:02}", h, m),
            (FieldSpec::Any, FieldSpec::Any) => "every minute".to_string(),
            (FieldSpec::Step(n), FieldSpec::Any) => format!("every {} minutes", n),
            (FieldSpec::Exact(m), FieldSpec::Any) => format!("at minute {} of every hour", m),
            (FieldSpec::Exact(m), FieldSpec::Step(n)) => {
                format!("at minute {} of every {} hours", m, n)
            }
            (minute, hour) => format!(
                "at minute {} of hour {}",
                render(minute, MINUTE),
                render(hour, HOUR)
            ),
        };

        let mut parts = vec![time];
        if self.day_of_month.is_restricted() {
            parts.push(format!("on day {}", render(&self.day_of_month, DAY_OF_MONTH)));
        }
        if self.month.is_restricted() {
            parts.push(format!("in month {}", render(&self.month, MONTH)));
        }
        if let FieldSpec::Exact(_) | FieldSpec::List(_) = &self.day_of_week {
            let days: Vec<&str> = match &self.day_of_week {
                FieldSpec::Exact(d) => vec![DAY_NAMES[normalize(*d, DAY_OF_WEEK) as usize]],
                FieldSpec::List(ds) => ds
                    .iter()
                    .map(|d| DAY_NAMES[normalize(*d, DAY_OF_WEEK) as usize])
                    .collect(),
                _ => Vec::new(),
            };
            parts.push(format!("on {}", days.join(", ")));
        } else if let FieldSpec::Step(n) = &self.day_of_week {
            parts.push(format!("every {} weekdays", n));
        }
        parts.join(" ")
    }
}

fn render(spec: &FieldSpec, rule: FieldRule) -> String {
    match spec {
        FieldSpec::Any => "*".to_string(),
        FieldSpec::Exact(v) => normalize(*v, rule).to_string(),
        FieldSpec::Step(n) => format!("*/{}", n),
        FieldSpec::List(values) => values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(","),
    }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

pub fn validate_schedule(expression: &str) -> bool {
    CronSchedule::parse(expression).is_ok()
}
