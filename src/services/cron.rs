use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Field-specific validation failure for a cron expression. Raised at
/// schedule creation time; expressions are never re-validated at tick time.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("{field}: invalid value `{value}`")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field}: {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field}: invalid range `{value}` (expected a-b with a < b)")]
    InvalidRange { field: &'static str, value: String },

    #[error("{field}: invalid step `{value}`")]
    InvalidStep { field: &'static str, value: String },

    #[error("day-of-month and day-of-week cannot both be restricted; leave one as `*`")]
    DayFieldsConflict,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 6 };

/// One parsed field: a bitmask of allowed values plus whether the field was
/// written as anything narrower than `*`.
#[derive(Debug, Clone, Copy)]
struct Field {
    mask: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.mask & (1u64 << value) != 0
    }
}

/// A validated 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week with 0 = Sunday).
#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

fn parse_int(spec: &FieldSpec, token: &str) -> Result<u32, CronError> {
    let value: u32 = token.parse().map_err(|_| CronError::InvalidValue {
        field: spec.name,
        value: token.to_string(),
    })?;
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

fn parse_field(spec: &FieldSpec, token: &str) -> Result<Field, CronError> {
    let full_mask = |mut mask: u64| {
        for v in spec.min..=spec.max {
            mask |= 1u64 << v;
        }
        mask
    };

    if token == "*" {
        return Ok(Field {
            mask: full_mask(0),
            restricted: false,
        });
    }

    if let Some(step_str) = token.strip_prefix("*/") {
        let step: u32 = step_str.parse().map_err(|_| CronError::InvalidStep {
            field: spec.name,
            value: token.to_string(),
        })?;
        if step == 0 || step > spec.max - spec.min + 1 {
            return Err(CronError::InvalidStep {
                field: spec.name,
                value: token.to_string(),
            });
        }
        let mut mask = 0u64;
        let mut v = spec.min;
        while v <= spec.max {
            mask |= 1u64 << v;
            v += step;
        }
        return Ok(Field {
            mask,
            restricted: true,
        });
    }

    if token.contains('-') {
        let (a, b) = token.split_once('-').expect("checked contains");
        let start = parse_int(spec, a)?;
        let end = parse_int(spec, b)?;
        if start >= end {
            return Err(CronError::InvalidRange {
                field: spec.name,
                value: token.to_string(),
            });
        }
        let mut mask = 0u64;
        for v in start..=end {
            mask |= 1u64 << v;
        }
        return Ok(Field {
            mask,
            restricted: true,
        });
    }

    // Single value or comma list of values.
    let mut mask = 0u64;
    for part in token.split(',') {
        let value = parse_int(spec, part)?;
        mask |= 1u64 << value;
    }
    Ok(Field {
        mask,
        restricted: true,
    })
}

impl CronExpr {
    /// Parse and validate a 5-field expression. Each field accepts `*`, a
    /// single integer, an inclusive range `a-b` (a < b), a step `*/n`, or a
    /// comma list of integers within the field's bounds.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let parsed = CronExpr {
            minute: parse_field(&MINUTE, fields[0])?,
            hour: parse_field(&HOUR, fields[1])?,
            day_of_month: parse_field(&DAY_OF_MONTH, fields[2])?,
            month: parse_field(&MONTH, fields[3])?,
            day_of_week: parse_field(&DAY_OF_WEEK, fields[4])?,
        };

        // Restricting both day fields is ambiguous across cron dialects
        // (AND vs OR); require one of the two to stay `*`.
        if parsed.day_of_month.restricted && parsed.day_of_week.restricted {
            return Err(CronError::DayFieldsConflict);
        }

        Ok(parsed)
    }

    /// Whether a timestamp (minute precision) matches this expression.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month())
            && self.day_of_month.contains(t.day())
            && self.day_of_week.contains(t.weekday().num_days_from_sunday())
    }

    /// The first matching minute strictly after `after`, scanning forward
    /// minute-by-minute. Bounded at four years, past which the expression is
    /// considered unsatisfiable (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        let limit = 4 * 366 * 24 * 60;
        for _ in 0..limit {
            if self.matches(t) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }
}
