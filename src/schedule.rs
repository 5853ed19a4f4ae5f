use chrono::NaiveDate;

pub const DEFAULT_DURATION_MIN: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("duration must be positive, got {0}")]
    NonPositiveDuration(i64),
    #[error("start minute {0} is outside 0-1439")]
    StartOutOfRange(i64),
    #[error("malformed clock time: {0:?}")]
    BadClock(String),
}

// Half-open minute interval [start, end) on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    date: NaiveDate,
    start_minute: i64,
    duration_minutes: i64,
}

impl TimeWindow {
    pub fn new(
        date: NaiveDate,
        start_minute: i64,
        duration_minutes: i64,
    ) -> Result<Self, WindowError> {
        if duration_minutes <= 0 {
            return Err(WindowError::NonPositiveDuration(duration_minutes));
        }
        if !(0..=1439).contains(&start_minute) {
            return Err(WindowError::StartOutOfRange(start_minute));
        }
        Ok(Self {
            date,
            start_minute,
            duration_minutes,
        })
    }

    pub fn from_clock(
        date: NaiveDate,
        clock: &str,
        duration_minutes: i64,
    ) -> Result<Self, WindowError> {
        Self::new(date, parse_clock(clock)?, duration_minutes)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn start_minute(&self) -> i64 {
        self.start_minute
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_minutes
    }

    // May run past minute 1439; the window still belongs to its start date.
    pub fn end_minute(&self) -> i64 {
        self.start_minute + self.duration_minutes
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.date == other.date
            && self.start_minute < other.end_minute()
            && other.start_minute < self.end_minute()
    }

    pub fn format_start(&self) -> String {
        format_clock(self.start_minute)
    }

    // Hours wrap modulo 24 for display only; end_minute() stays un-wrapped.
    pub fn format_end(&self) -> String {
        format_clock(self.end_minute())
    }

    pub fn format_range(&self) -> String {
        format!("{} - {}", self.format_start(), self.format_end())
    }
}

pub fn parse_clock(clock: &str) -> Result<i64, WindowError> {
    let mut parts = clock.trim().splitn(3, ':');
    let hour = parts
        .next()
        .and_then(|p| p.parse::<i64>().ok())
        .ok_or_else(|| WindowError::BadClock(clock.to_string()))?;
    let minute = parts
        .next()
        .and_then(|p| p.parse::<i64>().ok())
        .ok_or_else(|| WindowError::BadClock(clock.to_string()))?;
    if !(0..=23).contains(&hour) || !(0..=59).contains(&minute) {
        return Err(WindowError::BadClock(clock.to_string()));
    }
    Ok(hour * 60 + minute)
}

pub fn format_clock(minute: i64) -> String {
    format!("{:02}:{:02}", (minute / 60) % 24, minute % 60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Reject,
    AllowOverlap,
}

#[derive(Debug, Clone)]
pub struct ExistingSlot {
    pub id: String,
    pub customer_name: String,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub booking_id: String,
    pub customer_name: String,
    pub range: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Conflict(ConflictInfo),
}

// Pure decision over a caller-supplied snapshot: same day, cancelled rows and
// (on reschedule) the candidate's own prior row already filtered out.
pub fn admit(candidate: &TimeWindow, existing: &[ExistingSlot]) -> Admission {
    for slot in existing {
        if candidate.overlaps(&slot.window) {
            return Admission::Conflict(ConflictInfo {
                booking_id: slot.id.clone(),
                customer_name: slot.customer_name.clone(),
                range: slot.window.format_range(),
            });
        }
    }
    Admission::Admitted
}
