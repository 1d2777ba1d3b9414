//! Trading-window policy for the equities poller.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;

/// How often the poller should fetch at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCadence {
    /// Market open: poll on every tick.
    Fast,
    /// Shortly after close: poll once per slow interval.
    Slow,
    /// Outside the trading day.
    Idle,
}

/// Trading days and hours in a fixed timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketHours {
    tz: Tz,
    days: Vec<Weekday>,
    open: NaiveTime,
    close: NaiveTime,
    session_end: NaiveTime,
    slow_interval_minutes: u32,
    tick_seconds: u32,
}

impl Default for MarketHours {
    /// Mon-Fri 09:00-13:30 Asia/Taipei, slow polling until 14:00.
    fn default() -> Self {
        Self::new(
            chrono_tz::Asia::Taipei,
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            NaiveTime::from_hms_opt(13, 30, 0).unwrap_or(NaiveTime::MIN),
            NaiveTime::from_hms_opt(14, 0, 0).unwrap_or(NaiveTime::MIN),
        )
    }
}

impl MarketHours {
    /// Create a policy. Polls every 5 seconds while open and every 10
    /// minutes between `close` and `session_end`.
    #[must_use]
    pub fn new(
        tz: Tz,
        days: Vec<Weekday>,
        open: NaiveTime,
        close: NaiveTime,
        session_end: NaiveTime,
    ) -> Self {
        Self {
            tz,
            days,
            open,
            close,
            session_end,
            slow_interval_minutes: 10,
            tick_seconds: 5,
        }
    }

    /// Same days and hours, read in another timezone.
    #[must_use]
    pub const fn with_timezone(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    /// Market timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.tz
    }

    /// Cadence at an instant.
    #[must_use]
    pub fn cadence(&self, at: DateTime<Utc>) -> PollCadence {
        let local = at.with_timezone(&self.tz);
        if !self.days.contains(&local.weekday()) {
            return PollCadence::Idle;
        }

        let time = local.time();
        if time >= self.open && time < self.close {
            PollCadence::Fast
        } else if time >= self.close && time < self.session_end {
            PollCadence::Slow
        } else {
            PollCadence::Idle
        }
    }

    /// Whether the market is open.
    #[must_use]
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        self.cadence(at) == PollCadence::Fast
    }

    /// Whether the instant falls in the slow window after close.
    #[must_use]
    pub fn near_close(&self, at: DateTime<Utc>) -> bool {
        self.cadence(at) == PollCadence::Slow
    }

    /// Whether a poller tick at `at` should fetch quotes.
    #[must_use]
    pub fn should_poll(&self, at: DateTime<Utc>) -> bool {
        match self.cadence(at) {
            PollCadence::Fast => true,
            PollCadence::Slow => {
                let local = at.with_timezone(&self.tz);
                local.minute() % self.slow_interval_minutes == 0
                    && local.second() < self.tick_seconds
            }
            PollCadence::Idle => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;

    fn taipei(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Taipei
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    // 2024-03-04 is a Monday
    #[test_case(taipei(2024, 3, 4, 9, 0, 0), PollCadence::Fast ; "open bell")]
    #[test_case(taipei(2024, 3, 4, 13, 29, 55), PollCadence::Fast ; "last fast tick")]
    #[test_case(taipei(2024, 3, 4, 13, 30, 0), PollCadence::Slow ; "close bell")]
    #[test_case(taipei(2024, 3, 4, 14, 0, 0), PollCadence::Idle ; "session end")]
    #[test_case(taipei(2024, 3, 4, 8, 59, 59), PollCadence::Idle ; "pre open")]
    #[test_case(taipei(2024, 3, 9, 10, 0, 0), PollCadence::Idle ; "saturday")]
    fn cadence_by_local_time(at: DateTime<Utc>, expected: PollCadence) {
        assert_eq!(MarketHours::default().cadence(at), expected);
    }

    #[test_case(taipei(2024, 3, 4, 13, 40, 0), true ; "first tick of slow minute")]
    #[test_case(taipei(2024, 3, 4, 13, 40, 5), false ; "second tick of slow minute")]
    #[test_case(taipei(2024, 3, 4, 13, 45, 0), false ; "off interval minute")]
    #[test_case(taipei(2024, 3, 4, 11, 17, 35), true ; "open market")]
    fn should_poll_respects_slow_window(at: DateTime<Utc>, expected: bool) {
        assert_eq!(MarketHours::default().should_poll(at), expected);
    }

    #[test]
    fn open_and_near_close_helpers() {
        let hours = MarketHours::default();
        assert!(hours.is_open(taipei(2024, 3, 5, 10, 0, 0)));
        assert!(hours.near_close(taipei(2024, 3, 5, 13, 50, 0)));
        assert!(!hours.near_close(taipei(2024, 3, 5, 10, 0, 0)));
    }
}
