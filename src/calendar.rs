// =============================================================================
// MarketCalendar — exchange session boundaries
// =============================================================================
//
// The core never reasons about wall-clock UTC arithmetic or holiday tables
// directly; it calls through this trait. `NyseCalendar` is the concrete
// implementation (weekday + fixed US market holiday list, exchange-local
// pre-/post-session offsets) grounded on
// `examples/original_source/common/helpers/market_calendar.py`. `FakeCalendar`
// is a deterministic stand-in for tests, advancing only when told to.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;

/// Instant in the exchange's local time zone.
pub type InstantTz = DateTime<Tz>;

/// Boundary the core calls through for every wall-clock decision.
pub trait MarketCalendar: Send + Sync {
    /// Current time in the exchange's local zone.
    fn now(&self) -> InstantTz;

    /// The next regular session open at or after `after`. If `after` falls
    /// within an ongoing session, returns that session's open.
    fn next_session_open(&self, after: InstantTz) -> InstantTz;

    /// Fixed pre-market open offset of `session_day` (same calendar date as
    /// the session's regular open).
    fn pre_market_open(&self, session_day: InstantTz) -> InstantTz;

    /// Fixed post-session close offset of `session_day`.
    fn post_session_close(&self, session_day: InstantTz) -> InstantTz;
}

// =============================================================================
// NyseCalendar
// =============================================================================

/// Exchange calendar for a named exchange/timezone pair. Session days are
/// determined by weekday plus a fixed US-market holiday table; there is no
/// half-day modeling (a reasonable simplification the distilled spec does
/// not call out as required).
pub struct NyseCalendar {
    tz: Tz,
    pre_market_open_hour: u32,
    post_session_close_hour: u32,
    regular_open_hour: u32,
    regular_open_minute: u32,
    regular_close_hour: u32,
    regular_close_minute: u32,
    holidays: Vec<NaiveDate>,
}

impl NyseCalendar {
    pub fn new(tz: Tz, pre_market_open_hour: u32, post_session_close_hour: u32) -> Self {
        Self {
            tz,
            pre_market_open_hour,
            post_session_close_hour,
            regular_open_hour: 9,
            regular_open_minute: 30,
            regular_close_hour: 16,
            regular_close_minute: 0,
            holidays: default_us_market_holidays(),
        }
    }

    fn is_session_day(&self, date: NaiveDate) -> bool {
        use chrono::Weekday;
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn next_session_day(&self, from: NaiveDate) -> NaiveDate {
        let mut d = from;
        while !self.is_session_day(d) {
            d = d.succ_opt().expect("date arithmetic does not overflow");
        }
        d
    }

    fn regular_open_of(&self, date: NaiveDate) -> InstantTz {
        self.tz
            .with_ymd_and_hms(
                date.year(),
                date.month(),
                date.day(),
                self.regular_open_hour,
                self.regular_open_minute,
                0,
            )
            .single()
            .expect("valid local time")
    }

    fn regular_close_of(&self, date: NaiveDate) -> InstantTz {
        self.tz
            .with_ymd_and_hms(
                date.year(),
                date.month(),
                date.day(),
                self.regular_close_hour,
                self.regular_close_minute,
                0,
            )
            .single()
            .expect("valid local time")
    }
}

impl MarketCalendar for NyseCalendar {
    fn now(&self) -> InstantTz {
        chrono::Utc::now().with_timezone(&self.tz)
    }

    fn next_session_open(&self, after: InstantTz) -> InstantTz {
        let today = after.date_naive();
        if self.is_session_day(today) {
            let close = self.regular_close_of(today);
            if after < close {
                let open = self.regular_open_of(today);
                if after < open {
                    return open;
                }
                // Inside today's ongoing session: its open already passed.
                return open;
            }
        }
        let next_day = self.next_session_day(today.succ_opt().expect("date does not overflow"));
        self.regular_open_of(next_day)
    }

    fn pre_market_open(&self, session_day: InstantTz) -> InstantTz {
        let d = session_day.date_naive();
        self.tz
            .with_ymd_and_hms(d.year(), d.month(), d.day(), self.pre_market_open_hour, 0, 0)
            .single()
            .expect("valid local time")
    }

    fn post_session_close(&self, session_day: InstantTz) -> InstantTz {
        let d = session_day.date_naive();
        self.tz
            .with_ymd_and_hms(
                d.year(),
                d.month(),
                d.day(),
                self.post_session_close_hour,
                0,
                0,
            )
            .single()
            .expect("valid local time")
    }
}

/// A small, fixed table of US market holidays. Not exhaustive across years —
/// a production deployment would source this from a maintained calendar
/// feed; the core's contract (§4.1) only requires *a* holiday-aware
/// implementation, not a specific data source.
fn default_us_market_holidays() -> Vec<NaiveDate> {
    vec![
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2026, 1, 19).unwrap(),
        NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
        NaiveDate::from_ymd_opt(2026, 4, 3).unwrap(),
        NaiveDate::from_ymd_opt(2026, 5, 25).unwrap(),
        NaiveDate::from_ymd_opt(2026, 6, 19).unwrap(),
        NaiveDate::from_ymd_opt(2026, 7, 3).unwrap(),
        NaiveDate::from_ymd_opt(2026, 9, 7).unwrap(),
        NaiveDate::from_ymd_opt(2026, 11, 26).unwrap(),
        NaiveDate::from_ymd_opt(2026, 12, 25).unwrap(),
    ]
}

// =============================================================================
// FakeCalendar — deterministic test double
// =============================================================================

/// A calendar that only advances when [`FakeCalendar::advance`] is called.
/// Used by orchestrator/fan-out tests that need to assert on exact
/// wake-up timing without sleeping real wall-clock seconds.
pub struct FakeCalendar {
    current: parking_lot::RwLock<InstantTz>,
    pre_market_open_hour: u32,
    post_session_close_hour: u32,
}

impl FakeCalendar {
    pub fn new(start: InstantTz, pre_market_open_hour: u32, post_session_close_hour: u32) -> Self {
        Self {
            current: parking_lot::RwLock::new(start),
            pre_market_open_hour,
            post_session_close_hour,
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut g = self.current.write();
        *g = *g + by;
    }

    pub fn set(&self, to: InstantTz) {
        *self.current.write() = to;
    }
}

impl MarketCalendar for FakeCalendar {
    fn now(&self) -> InstantTz {
        *self.current.read()
    }

    fn next_session_open(&self, after: InstantTz) -> InstantTz {
        // Test double: every calendar day is a session day; open is 09:30.
        let d = after.date_naive();
        let open = after
            .timezone()
            .with_ymd_and_hms(d.year(), d.month(), d.day(), 9, 30, 0)
            .single()
            .expect("valid local time");
        if after <= open {
            open
        } else {
            let next_d = d.succ_opt().expect("date does not overflow");
            after
                .timezone()
                .with_ymd_and_hms(next_d.year(), next_d.month(), next_d.day(), 9, 30, 0)
                .single()
                .expect("valid local time")
        }
    }

    fn pre_market_open(&self, session_day: InstantTz) -> InstantTz {
        let d = session_day.date_naive();
        session_day
            .timezone()
            .with_ymd_and_hms(d.year(), d.month(), d.day(), self.pre_market_open_hour, 0, 0)
            .single()
            .expect("valid local time")
    }

    fn post_session_close(&self, session_day: InstantTz) -> InstantTz {
        let d = session_day.date_naive();
        session_day
            .timezone()
            .with_ymd_and_hms(
                d.year(),
                d.month(),
                d.day(),
                self.post_session_close_hour,
                0,
                0,
            )
            .single()
            .expect("valid local time")
    }
}
