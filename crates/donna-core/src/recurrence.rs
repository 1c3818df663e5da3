//! Platform recurrence rule -> calendar RRULE translation.

use tracing::warn;

use crate::RecurrenceRule;

const RRULE_PREFIX: &str = "RRULE:";
const UNTIL_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Monday-first weekday codes.
const WEEKDAY_CODES: [&str; 7] = ["MO", "TU", "WE", "TH", "FR", "SA", "SU"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
}

impl Frequency {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Frequency::Yearly),
            1 => Some(Frequency::Monthly),
            2 => Some(Frequency::Weekly),
            3 => Some(Frequency::Daily),
            _ => None,
        }
    }

    pub fn as_rrule(self) -> &'static str {
        match self {
            Frequency::Yearly => "YEARLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Daily => "DAILY",
        }
    }
}

fn weekday_code(day: u8) -> Option<&'static str> {
    WEEKDAY_CODES.get(usize::from(day)).copied()
}

fn join_numbers<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Translate a platform recurrence rule into calendar recurrence lines.
///
/// Returns at most one `RRULE:` line. An absent rule or an unrecognised
/// frequency yields no recurrence, so the event is created as a one-off.
/// Plain weekday markers take precedence over nth-weekday markers; the two
/// are never merged.
pub fn to_calendar_recurrence(rule: Option<&RecurrenceRule>) -> Vec<String> {
    let Some(rule) = rule else {
        return Vec::new();
    };

    let Some(frequency) = Frequency::from_code(rule.frequency) else {
        warn!(frequency = rule.frequency, "unknown recurrence frequency; treating event as non-recurring");
        return Vec::new();
    };

    let mut parts = vec![format!("FREQ={}", frequency.as_rrule())];

    if let Some(interval) = rule.interval.filter(|i| *i > 1) {
        parts.push(format!("INTERVAL={interval}"));
    }

    let by_weekday = rule.by_weekday.as_deref().unwrap_or_default();
    let by_n_weekday = rule.by_n_weekday.as_deref().unwrap_or_default();
    if !by_weekday.is_empty() {
        let days = by_weekday
            .iter()
            .filter_map(|day| weekday_code(*day))
            .collect::<Vec<_>>();
        if !days.is_empty() {
            parts.push(format!("BYDAY={}", days.join(",")));
        }
    } else if !by_n_weekday.is_empty() {
        let days = by_n_weekday
            .iter()
            .filter_map(|nth| weekday_code(nth.day).map(|code| format!("{}{code}", nth.n)))
            .collect::<Vec<_>>();
        if !days.is_empty() {
            parts.push(format!("BYDAY={}", days.join(",")));
        }
    }

    let by_month = rule.by_month.as_deref().unwrap_or_default();
    if !by_month.is_empty() {
        parts.push(format!("BYMONTH={}", join_numbers(by_month)));
    }

    let by_month_day = rule.by_month_day.as_deref().unwrap_or_default();
    if !by_month_day.is_empty() {
        parts.push(format!("BYMONTHDAY={}", join_numbers(by_month_day)));
    }

    if let Some(count) = rule.count.filter(|c| *c > 0) {
        parts.push(format!("COUNT={count}"));
    }

    if let Some(end_at) = rule.end_at {
        parts.push(format!("UNTIL={}", end_at.format(UNTIL_FORMAT)));
    }

    vec![format!("{RRULE_PREFIX}{}", parts.join(";"))]
}
