use chrono::{
    DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::compliance::OrderIntent;
use crate::execution::{ExecutionBatch, ExecutionEngine};
use crate::notify::{Event, NotificationDispatcher};
use crate::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Immediate,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid fire time '{0}', expected HH:MM or HH:MM:SS")]
    InvalidFireTime(String),
    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),
}

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub fire_at: NaiveTime,
    pub timezone: Tz,
    /// How late a start may be and still count as today's firing.
    pub tolerance: TimeDelta,
    pub skip_weekends: bool,
}

impl ScheduleConfig {
    pub fn parse(
        fire_at: &str,
        timezone: &str,
        tolerance: TimeDelta,
        skip_weekends: bool,
    ) -> Result<Self, SchedulerError> {
        let fire_at = NaiveTime::parse_from_str(fire_at, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(fire_at, "%H:%M:%S"))
            .map_err(|_| SchedulerError::InvalidFireTime(fire_at.to_string()))?;
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))?;

        Ok(Self {
            fire_at,
            timezone,
            tolerance,
            skip_weekends,
        })
    }

    /// The firing instant on `date`. A wall-clock time that falls in a DST
    /// gap moves forward by the gap; an ambiguous one takes the earlier
    /// instant.
    pub fn fire_instant(&self, date: NaiveDate) -> DateTime<Tz> {
        let local = date.and_time(self.fire_at);
        resolve_local(self.timezone, local)
    }

    /// Next instant to fire at, given the current time and the local date of
    /// the last firing.
    ///
    /// Today's instant is chosen while it is still ahead, or when it passed
    /// no more than `tolerance` ago and today has not fired yet. Otherwise
    /// the next eligible day is used.
    pub fn next_fire_time(&self, now: DateTime<Utc>, last_fired: Option<NaiveDate>) -> DateTime<Tz> {
        let local_now = now.with_timezone(&self.timezone);
        let today = local_now.date_naive();
        let mut date = today;

        loop {
            let candidate = self.fire_instant(date);
            let weekend = self.skip_weekends && matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
            let timely = candidate >= local_now
                || (date == today && local_now - candidate <= self.tolerance);

            if weekend {
                debug!(%date, "Skipping weekend");
            } else if timely && last_fired != Some(date) {
                return candidate;
            }

            match date.succ_opt() {
                Some(next) => date = next,
                None => return candidate,
            }
        }
    }
}

fn resolve_local(timezone: Tz, local: NaiveDateTime) -> DateTime<Tz> {
    if let Some(instant) = timezone.from_local_datetime(&local).earliest() {
        return instant;
    }

    // Inside a gap: read the wall time with the offset in force before it.
    let before = timezone
        .offset_from_utc_datetime(&(local - TimeDelta::days(1)))
        .fix();
    timezone.from_utc_datetime(&(local - TimeDelta::seconds(i64::from(before.local_minus_utc()))))
}

/// Daily trigger for the order batch.
#[derive(Debug)]
pub struct Scheduler {
    tokens: Arc<TokenManager>,
    engine: Arc<ExecutionEngine>,
    intents: Vec<OrderIntent>,
    config: ScheduleConfig,
    clock: Arc<dyn Clock>,
    notifications: NotificationDispatcher,
}

impl Scheduler {
    pub fn new(
        tokens: Arc<TokenManager>,
        engine: Arc<ExecutionEngine>,
        intents: Vec<OrderIntent>,
        config: ScheduleConfig,
        clock: Arc<dyn Clock>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            tokens,
            engine,
            intents,
            config,
            clock,
            notifications,
        }
    }

    /// IMMEDIATE fires once and returns. SCHEDULED fires once per day until
    /// `shutdown` flips to true or its sender goes away.
    pub async fn run(&self, mode: RunMode, mut shutdown: watch::Receiver<bool>) {
        if mode == RunMode::Immediate {
            info!("Running order batch immediately");
            self.fire().await;
            return;
        }

        let mut last_fired: Option<NaiveDate> = None;
        let mut announced = false;

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, scheduler stopping");
                return;
            }

            let now = self.clock.now();
            let target = self.config.next_fire_time(now, last_fired);
            let wait = (target.with_timezone(&Utc) - now)
                .to_std()
                .unwrap_or_default();

            if !announced {
                self.notifications.emit(Event::SchedulerStarted {
                    next_fire: target.with_timezone(&Utc),
                });
                announced = true;
            }
            info!(
                target = %target,
                wait_secs = wait.as_secs(),
                "Waiting for next firing"
            );

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested while waiting, no orders placed");
                    return;
                }
            }

            let late = self.clock.now() - target.with_timezone(&Utc);
            if late > self.config.tolerance {
                warn!(
                    late_secs = late.num_seconds(),
                    "Woke up after the firing instant, firing now"
                );
            }

            last_fired = Some(target.date_naive());
            self.fire().await;
        }
    }

    /// Re-checks the session with the broker, then executes the batch. A
    /// token failure skips the batch; the failure itself has already been
    /// notified.
    pub async fn fire(&self) -> Option<ExecutionBatch> {
        self.tokens.mark_unverified();
        match self.tokens.acquire().await {
            Ok(_) => Some(self.engine.execute_batch(&self.intents).await),
            Err(error) => {
                error!(%error, "No valid session, skipping this batch");
                None
            }
        }
    }
}
