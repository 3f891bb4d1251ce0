//! Daily start-hour anchoring.
//!
//! A project's first fire lands on its start hour: today if that hour is
//! still ahead, otherwise tomorrow. Later fires are spaced by the period
//! alone and drift away from the anchor.

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike};
use std::time::Duration;

/// When the first fire for `start_hour` happens, as wall-clock time.
pub fn first_fire<Tz: TimeZone>(start_hour: u32, now: &DateTime<Tz>) -> NaiveDateTime {
    let now = now.naive_local();
    let midnight = now.date().and_time(NaiveTime::MIN);
    let mut target = midnight + TimeDelta::hours(i64::from(start_hour));
    if now.hour() >= start_hour {
        target += TimeDelta::days(1);
    }
    target
}

/// Delay from `now` until the first fire, in whole seconds.
pub fn initial_delay<Tz: TimeZone>(start_hour: u32, now: &DateTime<Tz>) -> Duration {
    let local = now.naive_local();
    let truncated = local.with_nanosecond(0).unwrap_or(local);
    let delta = first_fire(start_hour, now) - truncated;
    delta.to_std().unwrap_or_default()
}
