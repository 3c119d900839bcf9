//! Wall clock helpers. The engine takes every time as an argument; these
//! produce them.

use chrono::{FixedOffset, NaiveDate, SecondsFormat, Utc};
use tally_engine::Timestamp;

/// Current time as an RFC 3339 UTC timestamp with milliseconds.
pub fn now_timestamp() -> Timestamp {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Today's calendar date at the given UTC offset.
pub fn local_today(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}
