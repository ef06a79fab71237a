use axum::http::{header, HeaderMap};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// `now < date + 1000 * (max-age - age)` in milliseconds.
///
/// Missing `date` or `cache-control` means not fresh. A missing `max-age`
/// directive or `age` header counts as 0; an unparsable one means not fresh.
pub fn is_fresh(headers: &HeaderMap, now: DateTime<Utc>) -> bool {
    expires_at_millis(headers).is_some_and(|expires| now.timestamp_millis() < expires)
}

fn expires_at_millis(headers: &HeaderMap) -> Option<i64> {
    let text = |name| headers.get(name).map(|value| value.to_str().ok());
    let cache_control = text(header::CACHE_CONTROL)??;
    let date = parse_http_date(text(header::DATE)??)?;
    let max_age = max_age(cache_control)?;
    let age = match text(header::AGE) {
        Some(age) => age?.trim().parse::<i64>().ok()?,
        None => 0,
    };

    let lifetime = max_age.checked_sub(age)?.checked_mul(1000)?;
    date.timestamp_millis().checked_add(lifetime)
}

/// Parses the three HTTP date forms: IMF-fixdate (and other RFC 2822
/// dates), obsolete RFC 850 and ANSI C `asctime()`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    // asctime pads single-digit days with a space.
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&collapsed, "%a %b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// `max-age` in seconds, 0 when the directive is absent and `None` when it
/// is present but not a number. The last occurrence wins.
pub fn max_age(cache_control: &str) -> Option<i64> {
    let mut max_age = 0;
    for directive in cache_control.split(',') {
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (directive.trim(), None),
        };
        if !name.eq_ignore_ascii_case("max-age") {
            continue;
        }
        max_age = value?.trim_matches('"').parse::<i64>().ok()?;
    }
    Some(max_age)
}
