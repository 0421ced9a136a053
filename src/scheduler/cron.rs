use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;

use crate::pipeline::Frequency;

/// One upcoming trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub freq: Frequency,
}

/// Cron schedules for the frequencies the daemon runs on its own.
#[derive(Clone)]
pub struct Scheduler {
    entries: Vec<(Frequency, CronSchedule)>,
}

impl Scheduler {
    /// Build schedules for `frequencies`. `manually` and duplicates are
    /// skipped.
    pub fn new(frequencies: &[Frequency]) -> Result<Self> {
        let mut entries: Vec<(Frequency, CronSchedule)> = Vec::new();
        for &freq in frequencies {
            let Some(expr) = freq.cron_expr() else {
                tracing::warn!(%freq, "frequency has no schedule, ignoring");
                continue;
            };
            if entries.iter().any(|(f, _)| *f == freq) {
                continue;
            }
            let schedule = CronSchedule::from_str(expr)
                .with_context(|| format!("invalid cron expression '{}' for {}", expr, freq))?;
            entries.push((freq, schedule));
        }
        Ok(Self { entries })
    }

    pub fn frequencies(&self) -> Vec<Frequency> {
        self.entries.iter().map(|(f, _)| *f).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest run strictly after `after`. Frequencies firing at the same
    /// instant are all returned.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<Frequency>)> {
        let upcoming: Vec<(DateTime<Utc>, Frequency)> = self
            .entries
            .iter()
            .filter_map(|(freq, schedule)| schedule.after(&after).next().map(|at| (at, *freq)))
            .collect();

        let earliest = upcoming.iter().map(|(at, _)| *at).min()?;
        let due = upcoming
            .into_iter()
            .filter(|(at, _)| *at == earliest)
            .map(|(_, freq)| freq)
            .collect();
        Some((earliest, due))
    }

    /// Runs between `from` and `from + hours`, in time order.
    /// This is strictly a dry-run preview, not the execution loop.
    pub fn preview_next_runs(&self, from: DateTime<Utc>, hours: u64) -> Vec<PlannedRun> {
        let end = from + Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for (freq, schedule) in &self.entries {
            for at in schedule.after(&from) {
                if at > end {
                    break;
                }
                preview.push(PlannedRun { at, freq: *freq });
            }
        }

        preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.freq.cmp(&b.freq)));
        preview
    }
}
