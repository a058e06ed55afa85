//! Weekly availability and selected work-session types.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Day names as providers store them in their weekly availability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DayOfWeek {
    #[serde(rename = "LUNES")]
    Lunes,
    #[serde(rename = "MARTES")]
    Martes,
    #[serde(rename = "MIÉRCOLES", alias = "MIERCOLES")]
    Miercoles,
    #[serde(rename = "JUEVES")]
    Jueves,
    #[serde(rename = "VIERNES")]
    Viernes,
    #[serde(rename = "SÁBADO", alias = "SABADO")]
    Sabado,
    #[serde(rename = "DOMINGO")]
    Domingo,
}

impl DayOfWeek {
    /// Accepts any casing, with or without accents.
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_uppercase();
        let folded: String = upper
            .chars()
            .map(|c| match c {
                'Á' => 'A',
                'É' => 'E',
                'Í' => 'I',
                'Ó' => 'O',
                'Ú' => 'U',
                other => other,
            })
            .collect();

        match folded.as_str() {
            "LUNES" => Some(Self::Lunes),
            "MARTES" => Some(Self::Martes),
            "MIERCOLES" => Some(Self::Miercoles),
            "JUEVES" => Some(Self::Jueves),
            "VIERNES" => Some(Self::Viernes),
            "SABADO" => Some(Self::Sabado),
            "DOMINGO" => Some(Self::Domingo),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DayOfWeek::Lunes => "LUNES",
            DayOfWeek::Martes => "MARTES",
            DayOfWeek::Miercoles => "MIÉRCOLES",
            DayOfWeek::Jueves => "JUEVES",
            DayOfWeek::Viernes => "VIERNES",
            DayOfWeek::Sabado => "SÁBADO",
            DayOfWeek::Domingo => "DOMINGO",
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        date.weekday().into()
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayOfWeek::Lunes,
            Weekday::Tue => DayOfWeek::Martes,
            Weekday::Wed => DayOfWeek::Miercoles,
            Weekday::Thu => DayOfWeek::Jueves,
            Weekday::Fri => DayOfWeek::Viernes,
            Weekday::Sat => DayOfWeek::Sabado,
            Weekday::Sun => DayOfWeek::Domingo,
        }
    }
}

impl std::fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One window of a provider's weekly availability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailabilityWindow {
    pub day: DayOfWeek,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl AvailabilityWindow {
    pub fn contains(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start_time <= start && end <= self.end_time
    }
}

/// Session slot as submitted by the client.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SlotRequest {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

/// A validated work session attached to a budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSlot {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    /// Derived from the time range, kept for display.
    pub duration_hours: Decimal,
}

impl TimeSlot {
    /// Builds a slot; `None` unless the range is a positive number of whole minutes.
    pub fn new(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Option<Self> {
        let span = end_time.signed_duration_since(start_time);
        if span.num_seconds() <= 0 || span.num_seconds() % 60 != 0 {
            return None;
        }

        Some(Self {
            date,
            start_time,
            end_time,
            duration_hours: minutes_to_hours(span.num_minutes()),
        })
    }

    pub fn duration_minutes(&self) -> i64 {
        self.end_time
            .signed_duration_since(self.start_time)
            .num_minutes()
    }

    pub fn day(&self) -> DayOfWeek {
        DayOfWeek::of(self.date)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.end_time)
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.date == other.date
            && self.start_time < other.end_time
            && other.start_time < self.end_time
    }
}

pub fn minutes_to_hours(minutes: i64) -> Decimal {
    (Decimal::from(minutes) / Decimal::from(60)).round_dp(4).normalize()
}

/// `None` when the hours do not convert to a whole number of minutes or
/// the conversion overflows.
pub fn hours_to_minutes(hours: Decimal) -> Option<i64> {
    let minutes = hours.checked_mul(Decimal::from(60))?;
    if minutes.fract().is_zero() {
        i64::try_from(minutes.trunc()).ok()
    } else {
        None
    }
}

/// `HH:MM` wire format for times of day; seconds are accepted on input.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<NaiveTime> {
        let raw = raw.trim();
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .ok()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid time '{}', expected HH:MM", raw))
        })
    }
}
