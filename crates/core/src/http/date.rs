//! IMF-fixdate formatting for the `Date` header, cached at second
//! granularity.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::http::HeaderValue;

static CACHE: Mutex<Option<(u64, HeaderValue)>> = Mutex::new(None);

const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Converts days since 1970-01-01 to a civil date.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

fn format_imf_fixdate(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    // 1970-01-01 was a Thursday.
    let weekday = ((days + 4) % 7) as usize;
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAYS[weekday],
        day,
        MONTHS[(month - 1) as usize],
        year,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60,
    )
}

/// The current time as a `Date` header value.
pub(crate) fn http_date_value() -> HeaderValue {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut cache = CACHE.lock();
    if let Some((cached_secs, value)) = &*cache {
        if *cached_secs == secs {
            return value.clone();
        }
    }
    let value = HeaderValue::from_str(&format_imf_fixdate(secs))
        .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"));
    *cache = Some((secs, value.clone()));
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_dates() {
        assert_eq!(format_imf_fixdate(0), "Thu, 01 Jan 1970 00:00:00 GMT");
        // 2015-10-21 07:28:00 UTC
        assert_eq!(format_imf_fixdate(1_445_412_480), "Wed, 21 Oct 2015 07:28:00 GMT");
        // Leap day.
        assert_eq!(format_imf_fixdate(1_582_934_400), "Sat, 29 Feb 2020 00:00:00 GMT");
    }

    #[test]
    fn test_header_value_is_ascii() {
        let value = http_date_value();
        assert!(value.to_str().expect("ascii").ends_with(" GMT"));
    }
}
