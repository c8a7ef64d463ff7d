//! Time distribution — spreads a bulk send across a bounded daily window.
//!
//! One generator per broadcast or nurturing run; it holds no shared state
//! and can be rebuilt from the same pacing parameters at any time.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use chatflow_core::types::PacingWindow;
use chatflow_core::{ChatflowError, ChatflowResult};

#[derive(Debug, Clone)]
pub struct TimeDistributionGenerator {
    start_time: NaiveTime,
    end_time: NaiveTime,
    daily_count: u32,
    per_message_delay: Duration,
    offset: FixedOffset,
    origin: NaiveDateTime,
    /// Running clock in tenant-local time.
    clock: NaiveDateTime,
    emitted: u64,
}

impl TimeDistributionGenerator {
    /// Generator whose first paced emission is `window.start_date` at
    /// `window.start_time`.
    pub fn new(window: &PacingWindow, offset: FixedOffset) -> ChatflowResult<Self> {
        let origin = window.start_date.and_time(window.start_time);
        Self::build(origin, window.start_time, window.end_time, window.daily_count, offset)
    }

    /// Generator whose clock starts at `instant` instead of the window start.
    pub fn starting_at(
        instant: DateTime<Utc>,
        start_time: NaiveTime,
        end_time: NaiveTime,
        daily_count: u32,
        offset: FixedOffset,
    ) -> ChatflowResult<Self> {
        let origin = instant.with_timezone(&offset).naive_local();
        Self::build(origin, start_time, end_time, daily_count, offset)
    }

    /// Generator driven only by [`Self::next_after`], clock at `instant`.
    pub fn unpaced(instant: DateTime<Utc>, offset: FixedOffset) -> Self {
        let origin = instant.with_timezone(&offset).naive_local();
        let start_time = NaiveTime::default();
        let end_time = start_time - Duration::seconds(1);
        Self {
            start_time,
            end_time,
            daily_count: 1,
            per_message_delay: end_time - start_time,
            offset,
            origin,
            clock: origin,
            emitted: 0,
        }
    }

    /// Same window and volume as [`Self::new`], with the clock at the later
    /// of the planned start and `now`.
    pub fn resumed(
        window: &PacingWindow,
        offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> ChatflowResult<Self> {
        let planned = window.start_date.and_time(window.start_time);
        let origin = planned.max(now.with_timezone(&offset).naive_local());
        Self::build(origin, window.start_time, window.end_time, window.daily_count, offset)
    }

    fn build(
        origin: NaiveDateTime,
        start_time: NaiveTime,
        end_time: NaiveTime,
        daily_count: u32,
        offset: FixedOffset,
    ) -> ChatflowResult<Self> {
        if daily_count == 0 {
            return Err(ChatflowError::validation("daily_count must be greater than zero"));
        }
        if end_time <= start_time {
            return Err(ChatflowError::validation(format!(
                "pacing window end {} must be after start {}",
                end_time, start_time
            )));
        }
        let window_ms = (end_time - start_time).num_milliseconds();
        Ok(Self {
            start_time,
            end_time,
            daily_count,
            per_message_delay: Duration::milliseconds(window_ms / i64::from(daily_count)),
            offset,
            origin,
            clock: origin,
            emitted: 0,
        })
    }

    pub fn per_message_delay(&self) -> Duration {
        self.per_message_delay
    }

    /// Paced emissions so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Rewinds to the state right after construction.
    pub fn restart(&mut self) {
        self.clock = self.origin;
        self.emitted = 0;
    }

    /// Next paced timestamp. The first emission of each day is at the day's
    /// start; every `daily_count` emissions roll to the following day.
    pub fn next_paced(&mut self) -> ChatflowResult<DateTime<Utc>> {
        let clock = if self.emitted == 0 {
            self.clamp_to_window(self.clock)?
        } else if self.emitted % u64::from(self.daily_count) == 0 {
            next_day(self.clock)?.and_time(self.start_time)
        } else {
            let advanced = self
                .clock
                .checked_add_signed(self.per_message_delay)
                .ok_or_else(past_calendar)?;
            self.clamp_to_window(advanced)?
        };
        self.clock = clock;
        self.emitted += 1;
        self.to_utc(self.clock)
    }

    /// Advances the clock by `delay_secs`, ignoring the window and the
    /// daily count.
    pub fn next_after(&mut self, delay_secs: u64) -> ChatflowResult<DateTime<Utc>> {
        self.clock = advance(self.clock, delay_secs)?;
        self.to_utc(self.clock)
    }

    /// Like [`Self::next_after`], but a time outside the window moves to the
    /// next opening and later offsets count from there.
    pub fn next_after_in_window(&mut self, delay_secs: u64) -> ChatflowResult<DateTime<Utc>> {
        let advanced = advance(self.clock, delay_secs)?;
        self.clock = self.clamp_to_window(advanced)?;
        self.to_utc(self.clock)
    }

    /// Times that drifted outside `[start, end)` move to the next window
    /// opening, one second past the start.
    fn clamp_to_window(&self, at: NaiveDateTime) -> ChatflowResult<NaiveDateTime> {
        let time = at.time();
        if time >= self.start_time && time < self.end_time {
            return Ok(at);
        }
        let bump = self.start_time + Duration::seconds(1);
        if time < self.start_time {
            Ok(at.date().and_time(bump))
        } else {
            Ok(next_day(at)?.and_time(bump))
        }
    }

    fn to_utc(&self, local: NaiveDateTime) -> ChatflowResult<DateTime<Utc>> {
        let naive_utc = local
            .checked_sub_signed(Duration::seconds(i64::from(self.offset.local_minus_utc())))
            .ok_or_else(past_calendar)?;
        Ok(Utc.from_utc_datetime(&naive_utc))
    }
}

impl Iterator for TimeDistributionGenerator {
    type Item = DateTime<Utc>;

    /// Ends once the clock runs off the representable calendar.
    fn next(&mut self) -> Option<Self::Item> {
        self.next_paced().ok()
    }
}

/// `at` moved `secs` seconds forward. Offsets that leave the representable
/// calendar are Validation errors.
pub fn after_secs(at: DateTime<Utc>, secs: u64) -> ChatflowResult<DateTime<Utc>> {
    seconds(secs)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| delay_out_of_range(secs))
}

fn advance(at: NaiveDateTime, secs: u64) -> ChatflowResult<NaiveDateTime> {
    seconds(secs)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| delay_out_of_range(secs))
}

fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

fn next_day(at: NaiveDateTime) -> ChatflowResult<NaiveDate> {
    at.date().succ_opt().ok_or_else(past_calendar)
}

fn delay_out_of_range(secs: u64) -> ChatflowError {
    ChatflowError::validation(format!("delay of {}s is out of range", secs))
}

fn past_calendar() -> ChatflowError {
    ChatflowError::validation("schedule runs past the last representable date")
}
