use chrono::{NaiveDate, NaiveDateTime};

use crate::error::MirrorError;

/// Every timestamp the remote service hands out is UTC with this literal suffix.
pub const TIMESTAMP_SUFFIX: &str = "+00:00";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Placeholder for "no local copy". Older than anything the wiki can report.
pub fn sentinel_timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1950, 1, 1)
        .and_then(|date| date.and_hms_opt(1, 1, 1))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Decode a remote `updated_at` value.
///
/// `None` decodes to [`sentinel_timestamp`]. Anything else must end in
/// `+00:00` and parse as `YYYY-MM-DDTHH:MM:SS`; otherwise the result is
/// [`MirrorError::TimestampDecode`].
pub fn decode_timestamp(value: Option<&str>) -> Result<NaiveDateTime, MirrorError> {
    let Some(value) = value else {
        return Ok(sentinel_timestamp());
    };
    let body = value
        .strip_suffix(TIMESTAMP_SUFFIX)
        .ok_or_else(|| MirrorError::TimestampDecode {
            value: value.to_string(),
        })?;
    NaiveDateTime::parse_from_str(body, TIMESTAMP_FORMAT).map_err(|_| {
        MirrorError::TimestampDecode {
            value: value.to_string(),
        }
    })
}

/// True when `remote` is strictly newer than `local`.
pub fn is_remote_newer(remote: Option<&str>, local: Option<&str>) -> Result<bool, MirrorError> {
    Ok(decode_timestamp(remote)? > decode_timestamp(local)?)
}
