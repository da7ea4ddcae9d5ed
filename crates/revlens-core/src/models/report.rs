use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Serialize decimals as plain JSON numbers; `formatted` carries the
/// human-readable rendering, so no precision is lost for consumers.
fn decimal_as_number<S>(value: &BigDecimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(value.to_f64().unwrap_or(0.0))
}

fn number_as_decimal<'de, D>(deserializer: D) -> Result<BigDecimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    BigDecimal::try_from(value).map_err(serde::de::Error::custom)
}

/// A monetary value paired with its canonical rendering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoneyView {
    #[serde(serialize_with = "decimal_as_number", deserialize_with = "number_as_decimal")]
    pub value: BigDecimal,
    pub formatted: String,
}

/// One month bucket inside a year (index 0..11)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthBucket {
    pub month: u32,
    pub label: String,
    #[serde(serialize_with = "decimal_as_number", deserialize_with = "number_as_decimal")]
    pub value: BigDecimal,
    pub formatted: String,
}

/// Year total plus its month buckets, sorted by month index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearBucket {
    pub year: i32,
    pub total: MoneyView,
    pub months: Vec<MonthBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearSeries {
    pub years: Vec<YearBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub revenue: MoneyView,
    pub non_revenue: MoneyView,
}

/// Trailing twelve-month revenue window ending at the latest revenue date
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailingTwelveMonths {
    #[serde(serialize_with = "decimal_as_number", deserialize_with = "number_as_decimal")]
    pub value: BigDecimal,
    pub formatted: String,
    pub reference_period_end: Option<NaiveDate>,
}

/// Classification and reconciliation counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    pub total: usize,
    pub auto_revenue: usize,
    pub agent_reviewed: usize,
    pub agent_decisions: usize,
    pub unresolved: usize,
    /// Revenue counted in totals but outside the monthly tables
    /// (undated or out-of-window dates)
    #[serde(serialize_with = "decimal_as_number", deserialize_with = "number_as_decimal")]
    pub revenue_outside_months: BigDecimal,
    #[serde(serialize_with = "decimal_as_number", deserialize_with = "number_as_decimal")]
    pub non_revenue_outside_months: BigDecimal,
}

/// The canonical machine form of a finished report.
///
/// `report_text` stored alongside it is always derived from this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReport {
    pub currency: String,
    pub generated_at: DateTime<Utc>,
    pub totals: ReportTotals,
    pub revenue: YearSeries,
    pub non_revenue: YearSeries,
    pub trailing_twelve_months: TrailingTwelveMonths,
    pub stats: ReportStats,
}
