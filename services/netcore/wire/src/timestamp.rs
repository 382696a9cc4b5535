//! Seconds-since-epoch timestamp codec.
//!
//! Wire form is a base-10 ASCII integer counting whole seconds since
//! 1970-01-01T00:00:00Z. Sub-second parts are dropped on encode (rounding
//! towards the past), so decoding always lands exactly on a second.

use crate::error::WireError;
use chrono::{DateTime, Utc};

/// Encode an optional time; absent input gives absent output
pub fn encode(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(encode_time)
}

/// Encode a time as whole seconds since the epoch
pub fn encode_time(time: DateTime<Utc>) -> String {
    time.timestamp().to_string()
}

/// Decode whole seconds since the epoch
pub fn decode(text: &str) -> Result<DateTime<Utc>, WireError> {
    let seconds: i64 = text
        .parse()
        .map_err(|_| WireError::Timestamp(text.to_string()))?;
    from_seconds(seconds)
}

/// Time at `seconds` since the epoch
pub fn from_seconds(seconds: i64) -> Result<DateTime<Utc>, WireError> {
    DateTime::from_timestamp(seconds, 0).ok_or(WireError::TimestampRange(seconds))
}

/// `time` with its sub-second part removed
pub fn truncate(time: DateTime<Utc>) -> Result<DateTime<Utc>, WireError> {
    from_seconds(time.timestamp())
}
