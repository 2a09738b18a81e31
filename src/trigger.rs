// src/trigger.rs
//
// =============================================================================
// RAGKEEPER: TRIGGER EVALUATION
// =============================================================================
//
// A tagged enum dispatched by `match`: adding a trigger kind means adding a
// variant and a match arm, not a new injected closure.

use crate::error::IndexError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTrigger {
    /// A full six-field cron expression (sec min hour day month dow), or
    /// built from individual `minute`/`hour`/`day_of_week` fields by
    /// `from_fields`.
    pub expression: String,
}

impl CronTrigger {
    pub fn from_expression(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    pub fn from_fields(minute: Option<u32>, hour: Option<u32>, day_of_week: Option<String>) -> Self {
        let minute = minute.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
        let hour = hour.map(|h| h.to_string()).unwrap_or_else(|| "*".to_string());
        let dow = day_of_week.unwrap_or_else(|| "*".to_string());
        Self {
            expression: format!("0 {minute} {hour} * * {dow}"),
        }
    }

    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, IndexError> {
        let schedule = CronSchedule::from_str(&self.expression)
            .map_err(|e| IndexError::Schedule(format!("invalid cron expression {:?}: {e}", self.expression)))?;
        schedule
            .after(&after)
            .next()
            .ok_or_else(|| IndexError::Schedule("cron schedule has no future fire time".into()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntervalTrigger {
    pub minutes: u32,
    pub hours: u32,
    pub days: u32,
}

impl IntervalTrigger {
    pub fn total_minutes(&self) -> i64 {
        self.minutes as i64 + self.hours as i64 * 60 + self.days as i64 * 1440
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.total_minutes() <= 0 {
            return Err(IndexError::Schedule(
                "interval trigger must total more than zero minutes".into(),
            ));
        }
        Ok(())
    }

    pub fn next_fire_from(&self, last_fire_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = last_fire_time.unwrap_or(now);
        base + chrono::Duration::minutes(self.total_minutes())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OneShotTrigger {
    pub fire_at: DateTime<Utc>,
    /// How late a missed OneShot may be before it is skipped instead of
    /// fired immediately on startup. `None` means "always fire, however late."
    pub lateness_tolerance_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Cron(CronTrigger),
    Interval(IntervalTrigger),
    OneShot(OneShotTrigger),
}

impl Trigger {
    /// Computes the next fire time strictly after `now`. `last_fire_time` is
    /// used by interval triggers; OneShot triggers ignore it but honour
    /// `lateness_tolerance_minutes` when the instant has already passed.
    pub fn next_fire_time(
        &self,
        now: DateTime<Utc>,
        last_fire_time: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, IndexError> {
        match self {
            Trigger::Cron(c) => c.next_fire_after(now).map(Some),
            Trigger::Interval(i) => {
                i.validate()?;
                Ok(Some(i.next_fire_from(last_fire_time, now)))
            }
            Trigger::OneShot(o) => {
                if o.fire_at > now {
                    return Ok(Some(o.fire_at));
                }
                match o.lateness_tolerance_minutes {
                    Some(tolerance) => {
                        let elapsed_minutes = (now - o.fire_at).num_minutes();
                        if elapsed_minutes <= tolerance {
                            Ok(Some(now))
                        } else {
                            Ok(None)
                        }
                    }
                    None => Ok(Some(now)),
                }
            }
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::OneShot(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_requires_positive_total() {
        let zero = IntervalTrigger {
            minutes: 0,
            hours: 0,
            days: 0,
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn interval_next_fire_uses_last_fire_time_when_present() {
        let trigger = IntervalTrigger {
            minutes: 30,
            hours: 0,
            days: 0,
        };
        let last = Utc::now() - chrono::Duration::minutes(10);
        let now = Utc::now();
        let next = trigger.next_fire_from(Some(last), now);
        assert_eq!(next, last + chrono::Duration::minutes(30));
    }

    #[test]
    fn one_shot_in_the_future_fires_at_its_instant() {
        let fire_at = Utc::now() + chrono::Duration::hours(1);
        let trigger = Trigger::OneShot(OneShotTrigger {
            fire_at,
            lateness_tolerance_minutes: None,
        });
        let next = trigger.next_fire_time(Utc::now(), None).unwrap();
        assert_eq!(next, Some(fire_at));
    }

    #[test]
    fn one_shot_past_tolerance_is_skipped() {
        let fire_at = Utc::now() - chrono::Duration::hours(5);
        let trigger = Trigger::OneShot(OneShotTrigger {
            fire_at,
            lateness_tolerance_minutes: Some(60),
        });
        let next = trigger.next_fire_time(Utc::now(), None).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn one_shot_within_tolerance_fires_immediately() {
        let fire_at = Utc::now() - chrono::Duration::minutes(10);
        let trigger = Trigger::OneShot(OneShotTrigger {
            fire_at,
            lateness_tolerance_minutes: Some(60),
        });
        let now = Utc::now();
        let next = trigger.next_fire_time(now, None).unwrap();
        assert_eq!(next, Some(now));
    }

    #[test]
    fn cron_every_minute_fires_in_the_future() {
        let trigger = CronTrigger::from_expression("0 * * * * *");
        let now = Utc::now();
        let next = trigger.next_fire_after(now).unwrap();
        assert!(next > now);
    }
}
