//! Usage aggregator: folds irrigation records into daily, weekly and monthly
//! chart buckets. Buckets are never stored; every query recomputes them from
//! the record history and a reference "now".

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, Time, UtcOffset, Weekday};
use tracing::{debug, warn};

use crate::observer::{Observers, Subscription};

const HOURS_PER_DAY: i64 = 24;
const DAYS_PER_WEEK: i64 = 7;
const WEEKS_PER_MONTH: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Manual,
    Ml,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Ml => write!(f, "ml"),
        }
    }
}

/// Summary of one closed session. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub duration_minutes: f64,
    pub volume_m3: f64,
    pub kind: SessionKind,
    pub source_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartBucket {
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub manual_quantity: f64,
    pub ml_quantity: f64,
    /// Running total of both kinds up to and including this bucket.
    pub accumulated: f64,
}

/// Live session pushed by the session coordinator. Never enters the
/// history; it is reported next to the buckets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provisional {
    pub kind: SessionKind,
    pub source_label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub volume_per_minute: f64,
    pub volume_cap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InProgress {
    pub kind: SessionKind,
    pub source_label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_minutes: f64,
    pub volume_m3: f64,
}

impl Provisional {
    pub fn estimate(&self, now: OffsetDateTime) -> InProgress {
        let elapsed_minutes = ((now - self.started_at).as_seconds_f64() / 60.0).max(0.0);
        let mut volume_m3 = elapsed_minutes * self.volume_per_minute;
        if let Some(cap) = self.volume_cap {
            volume_m3 = volume_m3.min(cap);
        }
        InProgress {
            kind: self.kind,
            source_label: self.source_label.clone(),
            started_at: self.started_at,
            elapsed_minutes,
            volume_m3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub granularity: Granularity,
    pub buckets: Vec<ChartBucket>,
    pub in_progress: Option<InProgress>,
}

/// Pushed to subscribers on every change.
#[derive(Debug, Clone, Serialize)]
pub struct UsageChart {
    pub daily: Vec<ChartBucket>,
    pub weekly: Vec<ChartBucket>,
    pub monthly: Vec<ChartBucket>,
    pub in_progress: Option<InProgress>,
    pub total_records: usize,
    pub last_record: Option<IrrigationRecord>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

struct History {
    records: VecDeque<IrrigationRecord>,
    provisional: Option<Provisional>,
}

pub struct UsageAggregator {
    history: Mutex<History>,
    limit: usize,
    offset: UtcOffset,
    observers: Observers<UsageChart>,
}

impl UsageAggregator {
    pub fn new(limit: usize, offset: UtcOffset) -> Self {
        Self {
            history: Mutex::new(History {
                records: VecDeque::new(),
                provisional: None,
            }),
            limit: limit.max(1),
            offset,
            observers: Observers::new(),
        }
    }

    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&UsageChart) + Send + Sync + 'static,
    {
        self.observers.subscribe(f)
    }

    /// Returns false, storing nothing, when the duration or volume is
    /// negative or not finite.
    pub fn add_record(&self, record: IrrigationRecord) -> bool {
        let usable = |v: f64| v.is_finite() && v >= 0.0;
        if !usable(record.duration_minutes) || !usable(record.volume_m3) {
            warn!(
                duration_minutes = record.duration_minutes,
                volume_m3 = record.volume_m3,
                "usage: unusable record dropped"
            );
            return false;
        }
        {
            let mut h = self.history.lock();
            h.records.push_back(record);
            while h.records.len() > self.limit {
                h.records.pop_front();
            }
            debug!(records = h.records.len(), "usage: record added");
        }
        self.publish_chart();
        true
    }

    pub fn set_provisional(&self, provisional: Option<Provisional>) {
        self.history.lock().provisional = provisional;
        self.publish_chart();
    }

    pub fn last_record(&self) -> Option<IrrigationRecord> {
        self.history.lock().records.back().cloned()
    }

    pub fn record_count(&self) -> usize {
        self.history.lock().records.len()
    }

    pub fn query(&self, granularity: Granularity, now: OffsetDateTime) -> Vec<ChartBucket> {
        let h = self.history.lock();
        fill(
            bucket_frames(granularity, now.to_offset(self.offset)),
            h.records.iter(),
        )
    }

    pub fn snapshot(&self, granularity: Granularity, now: OffsetDateTime) -> UsageSnapshot {
        UsageSnapshot {
            granularity,
            buckets: self.query(granularity, now),
            in_progress: self.in_progress(now),
        }
    }

    pub fn chart(&self, now: OffsetDateTime) -> UsageChart {
        UsageChart {
            daily: self.query(Granularity::Daily, now),
            weekly: self.query(Granularity::Weekly, now),
            monthly: self.query(Granularity::Monthly, now),
            in_progress: self.in_progress(now),
            total_records: self.record_count(),
            last_record: self.last_record(),
        }
    }

    fn in_progress(&self, now: OffsetDateTime) -> Option<InProgress> {
        self.history
            .lock()
            .provisional
            .as_ref()
            .map(|p| p.estimate(now))
    }

    fn publish_chart(&self) {
        let chart = self.chart(OffsetDateTime::now_utc());
        self.observers.notify(&chart);
    }
}

// ---------------------------------------------------------------------------
// Bucketing
// ---------------------------------------------------------------------------

struct Frame {
    label: String,
    start: OffsetDateTime,
    end: OffsetDateTime,
}

/// Bucket windows, oldest first. `now` is already in the display offset.
fn bucket_frames(granularity: Granularity, now: OffsetDateTime) -> Vec<Frame> {
    let today = now.replace_time(Time::MIDNIGHT);
    match granularity {
        Granularity::Daily => {
            let hour = today + Duration::hours(i64::from(now.hour()));
            (0..HOURS_PER_DAY)
                .rev()
                .map(|i| {
                    let start = hour - Duration::hours(i);
                    Frame {
                        label: format!("{:02}:00", start.hour()),
                        start,
                        end: start + Duration::HOUR,
                    }
                })
                .collect()
        }
        Granularity::Weekly => (0..DAYS_PER_WEEK)
            .rev()
            .map(|i| {
                let start = today - Duration::days(i);
                Frame {
                    label: weekday_label(start.weekday()).to_string(),
                    start,
                    end: start + Duration::DAY,
                }
            })
            .collect(),
        Granularity::Monthly => {
            let tomorrow = today + Duration::DAY;
            (0..WEEKS_PER_MONTH)
                .map(|k| {
                    let start = tomorrow - Duration::weeks(WEEKS_PER_MONTH - k);
                    Frame {
                        label: format!("W{}", k + 1),
                        start,
                        end: start + Duration::WEEK,
                    }
                })
                .collect()
        }
    }
}

fn fill<'a>(
    frames: Vec<Frame>,
    records: impl Iterator<Item = &'a IrrigationRecord> + Clone,
) -> Vec<ChartBucket> {
    let mut accumulated = 0.0;
    frames
        .into_iter()
        .map(|frame| {
            let (mut manual, mut ml) = (0.0, 0.0);
            for r in records
                .clone()
                .filter(|r| r.timestamp >= frame.start && r.timestamp < frame.end)
            {
                match r.kind {
                    SessionKind::Manual => manual += r.volume_m3,
                    SessionKind::Ml => ml += r.volume_m3,
                }
            }
            accumulated += manual + ml;
            ChartBucket {
                label: frame.label,
                start: frame.start,
                end: frame.end,
                manual_quantity: manual,
                ml_quantity: ml,
                accumulated,
            }
        })
        .collect()
}

fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "Mon",
        Weekday::Tuesday => "Tue",
        Weekday::Wednesday => "Wed",
        Weekday::Thursday => "Thu",
        Weekday::Friday => "Fri",
        Weekday::Saturday => "Sat",
        Weekday::Sunday => "Sun",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use time::macros::{datetime, offset};

    // Monday.
    const NOW: OffsetDateTime = datetime!(2025-03-10 14:35 UTC);

    fn record(at: OffsetDateTime, volume_m3: f64, kind: SessionKind) -> IrrigationRecord {
        IrrigationRecord {
            timestamp: at,
            duration_minutes: volume_m3 * 1000.0 / 15.0,
            volume_m3,
            kind,
            source_label: "test".to_string(),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn aggregator() -> UsageAggregator {
        UsageAggregator::new(10_000, UtcOffset::UTC)
    }

    // -- daily ------------------------------------------------------------

    #[test]
    fn two_manual_records_same_hour_sum() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-03-10 14:05 UTC), 0.3, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 14:20 UTC), 0.2, SessionKind::Manual));

        let daily = agg.query(Granularity::Daily, NOW);
        let last = daily.last().unwrap();
        assert_eq!(last.label, "14:00");
        assert!(approx(last.manual_quantity, 0.5));
        assert!(approx(last.ml_quantity, 0.0));
    }

    #[test]
    fn daily_has_24_rolling_hours() {
        let daily = aggregator().query(Granularity::Daily, NOW);
        assert_eq!(daily.len(), 24);
        assert_eq!(daily[0].label, "15:00");
        assert_eq!(daily[0].start, datetime!(2025-03-09 15:00 UTC));
        assert_eq!(daily[23].end, datetime!(2025-03-10 15:00 UTC));
    }

    #[test]
    fn kinds_are_kept_apart() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-03-10 09:10 UTC), 0.4, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 09:50 UTC), 0.25, SessionKind::Ml));

        let daily = agg.query(Granularity::Daily, NOW);
        let nine = daily.iter().find(|b| b.label == "09:00").unwrap();
        assert!(approx(nine.manual_quantity, 0.4));
        assert!(approx(nine.ml_quantity, 0.25));
    }

    #[test]
    fn bucket_start_inclusive_end_exclusive() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-03-10 13:00 UTC), 0.1, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 14:00 UTC), 0.2, SessionKind::Manual));

        let daily = agg.query(Granularity::Daily, NOW);
        assert!(approx(daily[22].manual_quantity, 0.1));
        assert!(approx(daily[23].manual_quantity, 0.2));
    }

    #[test]
    fn records_outside_window_ignored() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-03-09 14:59 UTC), 1.0, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 15:00 UTC), 1.0, SessionKind::Manual));

        let daily = agg.query(Granularity::Daily, NOW);
        assert!(daily.iter().all(|b| approx(b.manual_quantity, 0.0)));
    }

    #[test]
    fn accumulated_is_running_total() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-03-10 10:30 UTC), 0.1, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 12:30 UTC), 0.2, SessionKind::Ml));

        let daily = agg.query(Granularity::Daily, NOW);
        let at = |label: &str| daily.iter().find(|b| b.label == label).unwrap().accumulated;
        assert!(approx(at("09:00"), 0.0));
        assert!(approx(at("10:00"), 0.1));
        assert!(approx(at("11:00"), 0.1));
        assert!(approx(at("12:00"), 0.3));
        assert!(approx(daily[23].accumulated, 0.3));
    }

    #[test]
    fn labels_follow_display_offset() {
        let agg = UsageAggregator::new(100, offset!(+2));
        agg.add_record(record(datetime!(2025-03-10 23:10 UTC), 0.3, SessionKind::Manual));

        let daily = agg.query(Granularity::Daily, datetime!(2025-03-10 23:30 UTC));
        let last = daily.last().unwrap();
        assert_eq!(last.label, "01:00");
        assert!(approx(last.manual_quantity, 0.3));

        let weekly = agg.query(Granularity::Weekly, datetime!(2025-03-10 23:30 UTC));
        assert_eq!(weekly.last().unwrap().label, "Tue");
    }

    // -- weekly / monthly -------------------------------------------------

    #[test]
    fn weekly_has_seven_days_ending_today() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-03-04 08:00 UTC), 0.6, SessionKind::Ml));
        agg.add_record(record(datetime!(2025-03-10 06:00 UTC), 0.3, SessionKind::Manual));

        let weekly = agg.query(Granularity::Weekly, NOW);
        let labels: Vec<&str> = weekly.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, ["Tue", "Wed", "Thu", "Fri", "Sat", "Sun", "Mon"]);
        assert!(approx(weekly[0].ml_quantity, 0.6));
        assert!(approx(weekly[6].manual_quantity, 0.3));
    }

    #[test]
    fn monthly_has_four_weeks_oldest_first() {
        let agg = aggregator();
        agg.add_record(record(datetime!(2025-02-28 12:00 UTC), 0.5, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 07:00 UTC), 0.2, SessionKind::Ml));

        let monthly = agg.query(Granularity::Monthly, NOW);
        let labels: Vec<&str> = monthly.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, ["W1", "W2", "W3", "W4"]);
        assert_eq!(monthly[0].start, datetime!(2025-02-11 00:00 UTC));
        assert_eq!(monthly[3].end, datetime!(2025-03-11 00:00 UTC));
        assert!(approx(monthly[2].manual_quantity, 0.5));
        assert!(approx(monthly[3].ml_quantity, 0.2));
    }

    // -- history ----------------------------------------------------------

    #[test]
    fn history_trims_oldest_first() {
        let agg = UsageAggregator::new(2, UtcOffset::UTC);
        agg.add_record(record(datetime!(2025-03-10 10:00 UTC), 0.1, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 11:00 UTC), 0.2, SessionKind::Manual));
        agg.add_record(record(datetime!(2025-03-10 12:00 UTC), 0.3, SessionKind::Manual));

        assert_eq!(agg.record_count(), 2);
        let daily = agg.query(Granularity::Daily, NOW);
        assert!(approx(daily.last().unwrap().accumulated, 0.5));
        assert!(approx(agg.last_record().unwrap().volume_m3, 0.3));
    }

    #[test]
    fn unusable_records_rejected() {
        let agg = aggregator();
        assert!(agg.add_record(record(NOW, 0.1, SessionKind::Manual)));

        let mut bad = record(NOW, f64::NAN, SessionKind::Manual);
        assert!(!agg.add_record(bad.clone()));
        bad.volume_m3 = 0.1;
        bad.duration_minutes = -1.0;
        assert!(!agg.add_record(bad));

        assert_eq!(agg.record_count(), 1);
    }

    #[test]
    fn subscribers_notified_on_every_insert() {
        let agg = aggregator();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = agg.subscribe(move |chart| {
            assert_eq!(chart.daily.len(), 24);
            c.fetch_add(1, Ordering::SeqCst);
        });

        agg.add_record(record(NOW, 0.1, SessionKind::Manual));
        agg.add_record(record(NOW, 0.1, SessionKind::Ml));
        sub.unsubscribe();
        agg.add_record(record(NOW, 0.1, SessionKind::Ml));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // -- provisional ------------------------------------------------------

    #[test]
    fn provisional_reported_apart_from_buckets() {
        let agg = aggregator();
        agg.set_provisional(Some(Provisional {
            kind: SessionKind::Ml,
            source_label: "ML_Auto".to_string(),
            started_at: datetime!(2025-03-10 14:25 UTC),
            volume_per_minute: 0.015,
            volume_cap: None,
        }));

        let snap = agg.snapshot(Granularity::Daily, NOW);
        let live = snap.in_progress.unwrap();
        assert!(approx(live.elapsed_minutes, 10.0));
        assert!(approx(live.volume_m3, 0.15));
        assert!(snap.buckets.iter().all(|b| approx(b.ml_quantity, 0.0)));

        agg.set_provisional(None);
        assert!(agg.snapshot(Granularity::Daily, NOW).in_progress.is_none());
    }

    #[test]
    fn provisional_volume_capped() {
        let p = Provisional {
            kind: SessionKind::Ml,
            source_label: "ML_Auto".to_string(),
            started_at: datetime!(2025-03-10 13:00 UTC),
            volume_per_minute: 0.015,
            volume_cap: Some(0.4),
        };
        assert!(approx(p.estimate(NOW).volume_m3, 0.4));
    }
}
