//! Daily wall-clock timer.
//!
//! `RepeatingTimer` asks a next-fire function when to run, sleeps on an
//! injected `Clock` until then, runs the task and starts over. Tests drive
//! it with a manual clock so that days pass instantly.
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{error, info};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;

    async fn sleep_until(&self, deadline: DateTime<Tz>);
}

/// Real time in a fixed zone.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    async fn sleep_until(&self, deadline: DateTime<Tz>) {
        let remaining = (deadline.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining).await;
    }
}

/// Resolves `date` at `time` in `tz`.
///
/// A time that does not exist on that date (spring-forward gap) is moved
/// forward one hour; a repeated time resolves to its first occurrence.
fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
}

/// Next occurrence of the wall-clock `time` strictly after `now`.
///
/// If today's occurrence has already passed (or is exactly now), tomorrow's
/// is returned.
pub fn next_daily_occurrence(now: DateTime<Tz>, time: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = local_instant(tz, today, time).filter(|target| *target > now);
    candidate
        .or_else(|| {
            today
                .checked_add_days(Days::new(1))
                .and_then(|tomorrow| local_instant(tz, tomorrow, time))
        })
        .unwrap_or(now + chrono::Duration::days(1))
}

/// The calendar day before the one `instant` falls on.
pub fn previous_day(instant: &DateTime<Tz>) -> NaiveDate {
    let today = instant.date_naive();
    today.pred_opt().unwrap_or(today)
}

/// Handle that stops a running `RepeatingTimer`.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancel: watch::Sender<bool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        // Ignored error: the timer already stopped.
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

pub struct RepeatingTimer<C, N> {
    name: String,
    clock: C,
    next_fire: N,
    cancelled: watch::Receiver<bool>,
}

impl<C, N> RepeatingTimer<C, N>
where
    C: Clock,
    N: Fn(DateTime<Tz>) -> DateTime<Tz> + Send + Sync,
{
    pub fn new(name: &str, clock: C, next_fire: N) -> (Self, TimerHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                name: name.to_string(),
                clock,
                next_fire,
                cancelled: rx,
            },
            TimerHandle { cancel: tx },
        )
    }

    /// Runs until cancelled, returning the number of times `task` fired.
    ///
    /// The task receives the scheduled fire time. A task error is logged and
    /// the timer re-arms as usual.
    pub async fn run<F, Fut>(mut self, mut task: F) -> u64
    where
        F: FnMut(DateTime<Tz>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut fired = 0u64;

        loop {
            if *self.cancelled.borrow() {
                break;
            }

            let fire_at = (self.next_fire)(self.clock.now());
            info!(timer = %self.name, at = %fire_at.to_rfc3339(), "Scheduling next run");

            tokio::select! {
                biased;
                changed = self.cancelled.changed() => {
                    // A dropped handle also stops the timer.
                    if changed.is_err() || *self.cancelled.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.clock.sleep_until(fire_at) => {}
            }

            fired += 1;
            if let Err(e) = task(fire_at).await {
                error!(timer = %self.name, error = %e, "Scheduled task failed");
            }
        }

        info!(timer = %self.name, fired, "Timer stopped");
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::America::Chicago;
    use std::sync::{Arc, Mutex};

    /// Clock whose sleeps complete instantly by jumping to the deadline.
    #[derive(Clone)]
    struct ManualClock {
        now: Arc<Mutex<DateTime<Tz>>>,
    }

    impl ManualClock {
        fn starting_at(now: DateTime<Tz>) -> Self {
            Self {
                now: Arc::new(Mutex::new(now)),
            }
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Tz> {
            *self.now.lock().unwrap()
        }

        async fn sleep_until(&self, deadline: DateTime<Tz>) {
            let mut now = self.now.lock().unwrap();
            if deadline > *now {
                *now = deadline;
            }
        }
    }

    fn two_am() -> NaiveTime {
        NaiveTime::from_hms_opt(2, 0, 0).unwrap()
    }

    #[test]
    fn test_next_occurrence_later_today() {
        let now = Chicago.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).unwrap();
        let next = next_daily_occurrence(now, two_am());
        assert_eq!(next, Chicago.with_ymd_and_hms(2024, 3, 15, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_rolls_to_tomorrow() {
        let now = Chicago.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();
        let next = next_daily_occurrence(now, two_am());
        assert_eq!(next, Chicago.with_ymd_and_hms(2024, 3, 16, 2, 0, 0).unwrap());

        // Exactly at the scheduled time counts as passed.
        let at = Chicago.with_ymd_and_hms(2024, 3, 15, 2, 0, 0).unwrap();
        assert_eq!(
            next_daily_occurrence(at, two_am()),
            Chicago.with_ymd_and_hms(2024, 3, 16, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_occurrence_in_dst_gap_moves_forward() {
        // 02:00 does not exist on 10 March 2024 in Chicago.
        let now = Chicago.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let next = next_daily_occurrence(now, two_am());
        assert_eq!(next, Chicago.with_ymd_and_hms(2024, 3, 10, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_previous_day() {
        let instant = Chicago.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(previous_day(&instant), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[tokio::test]
    async fn test_timer_simulates_many_days() {
        let start = Chicago.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::starting_at(start);
        let (timer, handle) = RepeatingTimer::new("test", clock, |now| {
            next_daily_occurrence(now, two_am())
        });

        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let recorder = fired_at.clone();
        let fired = timer
            .run(|at| {
                let recorder = recorder.clone();
                let handle = handle.clone();
                async move {
                    let mut seen = recorder.lock().unwrap();
                    seen.push(at);
                    if seen.len() == 30 {
                        handle.cancel();
                    }
                    Ok(())
                }
            })
            .await;

        assert_eq!(fired, 30);
        let fired_at = fired_at.lock().unwrap();
        assert_eq!(fired_at[0], Chicago.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap());
        // Across the DST change every run still lands on local 02:00 or the first hour after the gap.
        assert!(fired_at.iter().all(|at| at.hour() == 2 || at.hour() == 3));
        assert!(fired_at.windows(2).all(|w| w[0].date_naive() < w[1].date_naive()));
    }

    #[tokio::test]
    async fn test_failing_task_does_not_stop_timer() {
        let start = Chicago.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (timer, handle) = RepeatingTimer::new("failing", ManualClock::starting_at(start), |now| {
            next_daily_occurrence(now, two_am())
        });

        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let fired = timer
            .run(|_| {
                let counter = counter.clone();
                let handle = handle.clone();
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n == 3 {
                        handle.cancel();
                    }
                    anyhow::bail!("portal unreachable")
                }
            })
            .await;

        assert_eq!(fired, 3);
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancel_before_first_run() {
        let start = Chicago.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (timer, handle) = RepeatingTimer::new("idle", ManualClock::starting_at(start), |now| {
            next_daily_occurrence(now, two_am())
        });
        handle.cancel();
        assert!(handle.is_cancelled());

        let fired = timer.run(|_| async { Ok(()) }).await;
        assert_eq!(fired, 0);
    }

    #[test]
    fn test_system_clock_uses_configured_zone() {
        let clock = SystemClock::new(Chicago);
        assert_eq!(clock.now().timezone(), Chicago);
        tokio_test::block_on(clock.sleep_until(clock.now() - chrono::Duration::seconds(5)));
    }
}
