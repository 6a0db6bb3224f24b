use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::window_start;

/// Build rate of one trailing window, assigned to the window's center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    pub at: DateTime<Utc>,
    pub builds_per_day: f64,
}

/// Rolling event rate in events per day.
///
/// For every event at `t`, counts the events in `[t - width, t]` and divides
/// by the window width in days. The value is reported at `t - width / 2` so
/// that series of different widths line up. Events less than one window
/// width after the first event are skipped: their window only partially
/// overlaps the data and would underestimate the rate.
#[allow(clippy::cast_precision_loss)]
pub fn rolling_event_rate(times: &[DateTime<Utc>], window_width_days: u32) -> Vec<RatePoint> {
    if window_width_days == 0 {
        return Vec::new();
    }

    let mut times = times.to_vec();
    times.sort_unstable();

    let Some(&first) = times.first() else {
        return Vec::new();
    };

    let width = Duration::days(i64::from(window_width_days));
    let half_width = width / 2;
    let days = f64::from(window_width_days);

    let mut lo = 0;
    times
        .iter()
        .enumerate()
        .filter_map(|(hi, &t)| {
            while times[lo] < window_start(t, width) {
                lo += 1;
            }
            if t - first < width {
                return None;
            }
            // Events sharing this timestamp all belong to the window
            let end = hi + times[hi..].iter().take_while(|&&other| other == t).count();
            Some(RatePoint {
                at: t - half_width,
                builds_per_day: (end - lo) as f64 / days,
            })
        })
        .collect()
}
