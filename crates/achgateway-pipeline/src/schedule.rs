//! Cutoff window scheduling in a shard's timezone.
//!
//! A [`CutoffTimes`] fires one tick per configured `HH:MM` wall-clock window
//! per day, resolved in the shard's named timezone on the day the window
//! occurs. Resolution follows filesystem-date-granularity semantics expected
//! by downstream processors:
//!
//! - A window that does not exist on a spring-forward day is **skipped**.
//! - A window that occurs twice on a fall-back day **fires twice**.
//!
//! Ticks are delivered on an internal channel consumed by the aggregator's
//! event loop; [`CutoffTimes::stop`] cancels all pending fires and is
//! idempotent.

use chrono::offset::LocalResult;
use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Days scanned ahead when resolving the next window occurrence. Two days
/// covers any DST transition; four leaves margin.
const LOOKAHEAD_DAYS: u64 = 4;

/// A wall-clock cutoff window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    hour: u32,
    minute: u32,
}

/// Scheduled cutoff windows for one shard.
#[derive(Debug)]
pub struct CutoffTimes {
    ticks: mpsc::Receiver<DateTime<Tz>>,
    stop: CancellationToken,
}

impl CutoffTimes {
    /// Creates a scheduler firing at each `HH:MM` window in the named
    /// timezone.
    ///
    /// An empty window list is valid and describes a manual-trigger-only
    /// shard. Must be called within a Tokio runtime.
    pub fn for_cutoff_times(tz_name: &str, windows: &[String]) -> Result<Self> {
        let tz: Tz = tz_name.parse().map_err(|_| Error::Schedule {
            message: format!("unknown timezone {tz_name:?}"),
        })?;
        let windows = windows
            .iter()
            .map(|w| parse_window(w))
            .collect::<Result<Vec<_>>>()?;

        let (tx, rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let token = stop.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_fire(tz, &windows, now) else {
                    // Nothing will ever fire; hold until stopped.
                    token.cancelled().await;
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(wait) => {
                        if tx.send(next.with_timezone(&tz)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self { ticks: rx, stop })
    }

    /// Receives the next fired window, or `None` once stopped.
    pub async fn recv(&mut self) -> Option<DateTime<Tz>> {
        self.ticks.recv().await
    }

    /// Cancels all pending fires. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for CutoffTimes {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn parse_window(s: &str) -> Result<Window> {
    let invalid = || Error::Schedule {
        message: format!("invalid cutoff window {s:?}, expected HH:MM"),
    };

    let (hh, mm) = s.split_once(':').ok_or_else(invalid)?;
    if hh.len() != 2 || mm.len() != 2 {
        return Err(invalid());
    }
    let hour: u32 = hh.parse().map_err(|_| invalid())?;
    let minute: u32 = mm.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(Window { hour, minute })
}

/// Returns the earliest window occurrence strictly after `after`.
fn next_fire(tz: Tz, windows: &[Window], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if windows.is_empty() {
        return None;
    }
    let start = after.with_timezone(&tz).date_naive();
    for day in 0..LOOKAHEAD_DAYS {
        let date = start.checked_add_days(Days::new(day))?;
        let best = windows
            .iter()
            .flat_map(|w| occurrences(tz, date, *w))
            .filter(|t| *t > after)
            .min();
        if best.is_some() {
            return best;
        }
    }
    None
}

/// Resolves a window on a calendar day in the zone: zero occurrences on a
/// spring-forward gap, two on a fall-back overlap.
fn occurrences(tz: Tz, date: NaiveDate, window: Window) -> Vec<DateTime<Utc>> {
    let Some(naive) = date.and_hms_opt(window.hour, window.minute, 0) else {
        return Vec::new();
    };
    match tz.from_local_datetime(&naive) {
        LocalResult::None => Vec::new(),
        LocalResult::Single(t) => vec![t.with_timezone(&Utc)],
        LocalResult::Ambiguous(first, second) => {
            vec![first.with_timezone(&Utc), second.with_timezone(&Utc)]
        }
    }
}
