use chrono::{Datelike, Duration, NaiveDate};
use serde::Deserialize;

pub const VALIDITY_FULL_YEAR: &str = "full_year";
pub const VALIDITY_FROM_DATE: &str = "from_date";

pub const ENROLLMENT_PRIMARY: &str = "primary";
pub const ENROLLMENT_AUXILIARY: &str = "auxiliary";

const DAY_CODES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

pub fn is_day_code(code: &str) -> bool {
    DAY_CODES.contains(&code)
}

/// mon = 0 .. sun = 6, matching chrono's num_days_from_monday.
pub fn day_index(code: &str) -> Option<i64> {
    DAY_CODES
        .iter()
        .position(|c| *c == code)
        .map(|i| i as i64)
}

pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityMode {
    FullYear,
    FromDate,
}

impl ValidityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidityMode::FullYear => VALIDITY_FULL_YEAR,
            ValidityMode::FromDate => VALIDITY_FROM_DATE,
        }
    }

    pub fn parse(raw: &str) -> Option<ValidityMode> {
        match raw {
            VALIDITY_FULL_YEAR => Some(ValidityMode::FullYear),
            VALIDITY_FROM_DATE => Some(ValidityMode::FromDate),
            _ => None,
        }
    }
}

/// The date range over which a teacher-subject assignment applies.
#[derive(Debug, Clone)]
pub struct Validity {
    pub mode: ValidityMode,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Validity {
    /// A teacher occupies a slot in a row iff the owning instance's start
    /// date falls within this window. Full-year always qualifies.
    pub fn covers_instance_start(&self, instance_start: NaiveDate) -> bool {
        match self.mode {
            ValidityMode::FullYear => true,
            ValidityMode::FromDate => {
                let Some(start) = self.start_date else {
                    return false;
                };
                if instance_start < start {
                    return false;
                }
                match self.end_date {
                    Some(end) => instance_start <= end,
                    None => true,
                }
            }
        }
    }

    /// Reads a validity back from its persisted columns.
    pub fn from_db(
        mode: &str,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> anyhow::Result<Validity> {
        let mode = ValidityMode::parse(mode)
            .ok_or_else(|| anyhow::anyhow!("unknown validity mode in store: {}", mode))?;
        let start_date = match start_date {
            Some(raw) => Some(
                parse_iso_date(raw)
                    .ok_or_else(|| anyhow::anyhow!("bad start_date in store: {}", raw))?,
            ),
            None => None,
        };
        let end_date = match end_date {
            Some(raw) => Some(
                parse_iso_date(raw)
                    .ok_or_else(|| anyhow::anyhow!("bad end_date in store: {}", raw))?,
            ),
            None => None,
        };
        Ok(Validity {
            mode,
            start_date,
            end_date,
        })
    }
}

/// Wire shape for a validity window, validated at the boundary before the
/// engine ever sees it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValiditySpec {
    pub mode: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

impl ValiditySpec {
    pub fn resolve(&self) -> Result<Validity, String> {
        let mode = ValidityMode::parse(&self.mode).ok_or_else(|| {
            format!(
                "validity.mode must be one of: {}, {}",
                VALIDITY_FULL_YEAR, VALIDITY_FROM_DATE
            )
        })?;

        let start_date = match self.start_date.as_deref() {
            Some(raw) => Some(
                parse_iso_date(raw)
                    .ok_or_else(|| format!("validity.startDate is not a valid date: {}", raw))?,
            ),
            None => None,
        };
        let end_date = match self.end_date.as_deref() {
            Some(raw) => Some(
                parse_iso_date(raw)
                    .ok_or_else(|| format!("validity.endDate is not a valid date: {}", raw))?,
            ),
            None => None,
        };

        if mode == ValidityMode::FromDate && start_date.is_none() {
            return Err("validity.startDate is required for from_date".to_string());
        }
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if end < start {
                return Err("validity.endDate must be on or after startDate".to_string());
            }
        }

        Ok(Validity {
            mode,
            start_date,
            end_date,
        })
    }
}

/// First date on or after `from` that falls on the given weekday.
pub fn first_on_or_after(target_weekday: i64, from: NaiveDate) -> NaiveDate {
    let current = from.weekday().num_days_from_monday() as i64;
    let mut ahead = target_weekday - current;
    if ahead < 0 {
        ahead += 7;
    }
    from + Duration::days(ahead)
}

/// All dates matching `day_code` in [window_start, window_end], stepping a
/// week at a time, capped at `max_weeks` to bound pathological windows.
pub fn dates_for_day(
    day_code: &str,
    window_start: NaiveDate,
    window_end: NaiveDate,
    max_weeks: usize,
) -> Vec<NaiveDate> {
    let Some(target) = day_index(day_code) else {
        return Vec::new();
    };
    let mut dates = Vec::new();
    let mut current = first_on_or_after(target, window_start);
    while current <= window_end && dates.len() < max_weeks {
        dates.push(current);
        current += Duration::days(7);
    }
    dates
}
