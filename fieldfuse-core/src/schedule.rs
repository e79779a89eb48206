//! Time-of-Day Capture Schedule
//!
//! ## Overview
//!
//! How often the station captures, and how many exposures it brackets,
//! depends on the light: dawn and dusk change fast and are sampled densely,
//! the night gets one coarse single-exposure frame per hour.
//!
//! The policy is an ordered table of hour bands evaluated by first match,
//! with a fallback for hours no band covers. Bands may wrap midnight
//! (`start_hour > end_hour`).
//!
//! ## Default Table
//!
//! | Hours          | Interval | Bracket (min, max, count) |
//! |----------------|----------|---------------------------|
//! | 23:00 - 04:00  | 60 min   | (0, 0, 1)                 |
//! | 05:00 - 07:00  | 10 min   | (-2, 2, 5)                |
//! | 17:00 - 19:00  | 10 min   | (-2, 2, 5)                |
//! | anything else  | 30 min   | (-2, 2, 5)                |

use std::time::Duration;

use serde::Deserialize;

use crate::errors::SetupError;

/// Exposure bracket: `count` EV steps spread evenly over `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Bracket {
    pub min: f32,
    pub max: f32,
    pub count: usize,
}

impl Bracket {
    /// Five frames from -2 EV to +2 EV
    pub const STANDARD: Bracket = Bracket { min: -2.0, max: 2.0, count: 5 };

    /// One frame at 0 EV
    pub const SINGLE: Bracket = Bracket { min: 0.0, max: 0.0, count: 1 };
}

/// What the coordinator does next: wait `interval`, then capture `bracket`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePlan {
    pub interval: Duration,
    pub bracket: Bracket,
}

impl SchedulePlan {
    /// Plan for hours no default band covers
    pub const FALLBACK: SchedulePlan = SchedulePlan {
        interval: Duration::from_secs(30 * 60),
        bracket: Bracket::STANDARD,
    };
}

/// One row of the schedule table
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScheduleBand {
    /// First hour covered, 0-23
    pub start_hour: u32,
    /// First hour no longer covered, 0-24; less than `start_hour` wraps midnight
    pub end_hour: u32,
    pub interval_secs: u64,
    pub bracket: Bracket,
}

impl ScheduleBand {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    fn plan(&self) -> SchedulePlan {
        SchedulePlan {
            interval: Duration::from_secs(self.interval_secs),
            bracket: self.bracket,
        }
    }
}

/// Ordered band table with a fallback plan
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTable {
    bands: Vec<ScheduleBand>,
    fallback: SchedulePlan,
}

impl ScheduleTable {
    pub fn new(bands: Vec<ScheduleBand>, fallback: SchedulePlan) -> Result<Self, SetupError> {
        for band in &bands {
            if band.start_hour > 23 || band.end_hour > 24 {
                return Err(SetupError::Config(format!(
                    "schedule band {}-{} has an hour out of range",
                    band.start_hour, band.end_hour
                )));
            }
            validate_plan(&band.plan())?;
        }
        validate_plan(&fallback)?;
        Ok(Self { bands, fallback })
    }

    /// First band covering `hour`, else the fallback
    pub fn plan_for(&self, hour: u32) -> SchedulePlan {
        self.bands
            .iter()
            .find(|band| band.contains(hour))
            .map(ScheduleBand::plan)
            .unwrap_or(self.fallback)
    }

    pub fn bands(&self) -> &[ScheduleBand] {
        &self.bands
    }
}

impl Default for ScheduleTable {
    fn default() -> Self {
        let short = |start_hour, end_hour| ScheduleBand {
            start_hour,
            end_hour,
            interval_secs: 10 * 60,
            bracket: Bracket::STANDARD,
        };

        Self {
            bands: vec![
                ScheduleBand {
                    start_hour: 23,
                    end_hour: 4,
                    interval_secs: 60 * 60,
                    bracket: Bracket::SINGLE,
                },
                short(5, 7),
                short(17, 19),
            ],
            fallback: SchedulePlan::FALLBACK,
        }
    }
}

fn validate_plan(plan: &SchedulePlan) -> Result<(), SetupError> {
    if plan.interval.is_zero() {
        return Err(SetupError::Config("schedule interval must be positive".into()));
    }
    if plan.bracket.count == 0 {
        return Err(SetupError::Config("bracket count must be at least 1".into()));
    }
    if plan.bracket.min > plan.bracket.max {
        return Err(SetupError::Config(format!(
            "bracket min {} exceeds max {}",
            plan.bracket.min, plan.bracket.max
        )));
    }
    Ok(())
}
