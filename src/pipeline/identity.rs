use crate::models::DayIdentity;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

const CLOSE_OF_BUSINESS_HOUR: u32 = 17;

/// Human label of the day: `Wed 10 Jan 2024`.
pub fn day_label(date: NaiveDate) -> String {
    date.format("%a %d %b %Y").to_string()
}

/// `Wed 10 Jan 2024` → `wed-10-jan-2024`.
pub fn day_identity(date: NaiveDate) -> DayIdentity {
    DayIdentity::from(day_label(date).to_lowercase().replace(' ', "-"))
}

/// 17:00 UTC on the given day.
pub fn close_of_business(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::from_hms_opt(CLOSE_OF_BUSINESS_HOUR, 0, 0).unwrap_or_default())
}
