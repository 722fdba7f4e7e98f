use time::{format_description::well_known::Rfc3339, OffsetDateTime, PrimitiveDateTime};

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}

/// Whole-second span between two UTC timestamps; negative spans clamp to zero.
pub(crate) fn seconds_between(start: PrimitiveDateTime, end: PrimitiveDateTime) -> f64 {
    (end.assume_utc() - start.assume_utc()).as_seconds_f64().max(0.0)
}

pub(crate) fn seconds_as_duration(seconds: u64) -> time::Duration {
    time::Duration::seconds(seconds.min(i64::MAX as u64) as i64)
}
