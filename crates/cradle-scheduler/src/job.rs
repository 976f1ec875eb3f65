//! Scheduled job types
//!
//! A job ties one agent to one schedule. Schedules come from trigger cron
//! strings: standard 5-field cron, 6-field cron with a leading seconds field,
//! or the legacy `every N hours` / `every N minutes` shorthand.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Longest fixed period a schedule may have (ten years)
pub const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 3600;

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron expression in the 6-field (seconds first) form the `cron` crate expects
    Cron { expr: String },

    /// Fixed period
    Every { period_ms: u64 },
}

impl ScheduleSpec {
    /// Parse a trigger schedule string
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.to_lowercase().starts_with("every") {
            return parse_every(raw);
        }

        let fields: Vec<&str> = raw.split_whitespace().collect();
        let expr = match fields.len() {
            5 => {
                let dow = translate_day_of_week(fields[4])?;
                format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
            }
            6 | 7 => fields.join(" "),
            n => bail!("cron expression '{}' has {} fields, expected 5 or 6", raw, n),
        };

        cron::Schedule::from_str(&expr)
            .with_context(|| format!("Invalid cron expression: {}", raw))?;
        Ok(Self::Cron { expr })
    }

    pub fn every(period: Duration) -> Self {
        Self::Every {
            period_ms: period.as_millis() as u64,
        }
    }

    /// Next firing time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { expr } => cron::Schedule::from_str(expr).ok()?.after(&now).next(),
            Self::Every { period_ms } => {
                let period = chrono::Duration::try_milliseconds(i64::try_from(*period_ms).ok()?)?;
                now.checked_add_signed(period)
            }
        }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron { expr } => write!(f, "cron '{}'", expr),
            Self::Every { period_ms } => write!(f, "every {:?}", Duration::from_millis(*period_ms)),
        }
    }
}

fn parse_every(raw: &str) -> Result<ScheduleSpec> {
    let parts: Vec<String> = raw.split_whitespace().map(str::to_lowercase).collect();
    if parts.len() != 3 {
        bail!("expected 'every N hours' or 'every N minutes', got '{}'", raw);
    }
    let n: u64 = parts[1]
        .parse()
        .with_context(|| format!("invalid interval count in '{}'", raw))?;
    if n == 0 {
        bail!("interval must be positive in '{}'", raw);
    }
    let unit_secs = match parts[2].trim_end_matches('s') {
        "hour" => 3600,
        "minute" | "min" => 60,
        other => bail!("unsupported interval unit '{}'", other),
    };
    let secs = n
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_PERIOD_SECS)
        .ok_or_else(|| anyhow!("interval in '{}' is longer than ten years", raw))?;
    Ok(ScheduleSpec::every(Duration::from_secs(secs)))
}

/// Standard cron numbers days 0-7 from Sunday; the `cron` crate numbers them
/// 1-7 from Sunday. Names and `*` pass through untouched.
fn translate_day_of_week(field: &str) -> Result<String> {
    let map_num = |s: &str| -> Result<String> {
        if s.is_empty() || s == "*" || s == "?" || !s.chars().all(|c| c.is_ascii_digit()) {
            return Ok(s.to_string());
        }
        let n: u32 = s.parse().map_err(|_| anyhow!("invalid day of week '{}'", s))?;
        if n > 7 {
            bail!("day of week {} out of range", n);
        }
        Ok(((n % 7) + 1).to_string())
    };

    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let range = match range.split_once('-') {
            Some((from, to)) => format!("{}-{}", map_num(from)?, map_num(to)?),
            None => map_num(range)?,
        };
        parts.push(match step {
            Some(step) => format!("{}/{}", range, step),
            None => range,
        });
    }
    Ok(parts.join(","))
}

/// One agent bound to one schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub agent_id: String,
    pub schedule: ScheduleSpec,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(agent_id: impl Into<String>, schedule: ScheduleSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            schedule,
            created_at: Utc::now(),
        }
    }

    pub fn description(&self) -> String {
        format!("agent {} ({})", self.agent_id, self.schedule)
    }
}

/// Emitted each time a job fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub job_id: String,
    pub agent_id: String,
    pub fired_at: DateTime<Utc>,
}

impl ScheduleEvent {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            agent_id: job.agent_id.clone(),
            fired_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_field_gets_seconds() {
        let spec = ScheduleSpec::parse("0 9,15,20 * * *").unwrap();
        assert_eq!(
            spec,
            ScheduleSpec::Cron {
                expr: "0 0 9,15,20 * * *".to_string()
            }
        );

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let next = spec.next_after(now).unwrap();
        assert_eq!(next.hour(), 15);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_six_field_passes_through() {
        let spec = ScheduleSpec::parse("*/10 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 1).unwrap();
        assert_eq!(spec.next_after(now).unwrap().second(), 10);
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("1-5").unwrap(), "2-6");
        assert_eq!(translate_day_of_week("0,6").unwrap(), "1,7");
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_day_of_week("9").is_err());

        // 2024-03-02 is a Saturday; weekdays-only skips to Monday
        let spec = ScheduleSpec::parse("0 9 * * 1-5").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        let next = spec.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_every_shorthand() {
        assert_eq!(
            ScheduleSpec::parse("every 4 hours").unwrap(),
            ScheduleSpec::every(Duration::from_secs(4 * 3600))
        );
        assert_eq!(
            ScheduleSpec::parse("Every 1 minute").unwrap(),
            ScheduleSpec::every(Duration::from_secs(60))
        );
        assert!(ScheduleSpec::parse("every 0 hours").is_err());
        assert!(ScheduleSpec::parse("every few days").is_err());
    }

    #[test]
    fn test_oversized_interval_is_an_error() {
        let err = ScheduleSpec::parse("every 1000000000000 hours").unwrap_err();
        assert!(err.to_string().contains("ten years"));
        assert!(ScheduleSpec::parse("every 18446744073709551615 minutes").is_err());
        assert!(ScheduleSpec::parse("every 87600 hours").is_ok());

        let huge = ScheduleSpec::Every { period_ms: u64::MAX };
        assert!(huge.next_after(Utc::now()).is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ScheduleSpec::parse("").is_err());
        assert!(ScheduleSpec::parse("61 * * * *").is_err());
        assert!(ScheduleSpec::parse("* * *").is_err());
    }

    #[test]
    fn test_job_description() {
        let job = Job::new("agent-1", ScheduleSpec::every(Duration::from_secs(60)));
        assert!(!job.id.is_empty());
        assert!(job.description().contains("agent-1"));
        let event = ScheduleEvent::new(&job);
        assert_eq!(event.agent_id, "agent-1");
        assert_eq!(event.job_id, job.id);
    }
}
