//! Monthly/yearly aggregation, the trailing-twelve-month revenue window, and
//! the canonical money rendering.
//!
//! Transactions with no usable value date still count toward the totals but
//! never enter the month tables; the difference is surfaced through the
//! report stats so consumers can reason about unattributed sums.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::BTreeMap;

use revlens_core::models::{
    ClassificationSource, MoneyView, MonthBucket, ReportStats, ReportTotals, StatementTransaction,
    StructuredReport, TrailingTwelveMonths, YearBucket, YearSeries,
};

/// Localized month labels, index 0..11
const MONTH_LABELS: [&str; 12] = [
    "Январь",
    "Февраль",
    "Март",
    "Апрель",
    "Май",
    "Июнь",
    "Июль",
    "Август",
    "Сентябрь",
    "Октябрь",
    "Ноябрь",
    "Декабрь",
];

/// Monthly aggregation window floor
const WINDOW_FLOOR: (i32, u32, u32) = (2000, 1, 1);

/// Days of slack for slightly future-dated entries
const WINDOW_FUTURE_DAYS: i64 = 3;

fn aggregation_window(now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
    let floor = NaiveDate::from_ymd_opt(WINDOW_FLOOR.0, WINDOW_FLOOR.1, WINDOW_FLOOR.2)
        .expect("static window floor");
    let ceiling = now.date_naive() + chrono::Duration::days(WINDOW_FUTURE_DAYS);
    (floor, ceiling)
}

fn in_window(date: NaiveDate, window: (NaiveDate, NaiveDate)) -> bool {
    date >= window.0 && date <= window.1
}

// ── Money rendering ───────────────────────────────────────────────────────────

/// Render a decimal in the canonical locale-stable form: thousands grouped
/// with narrow no-break spaces, comma decimal separator, two fraction
/// digits, trailing currency tag. Pure function.
pub fn format_amount(value: &BigDecimal, currency: &str) -> String {
    let rounded = value.with_scale_round(2, bigdecimal::RoundingMode::HalfUp);
    let plain = rounded.to_string();

    let (sign, digits) = match plain.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", plain.as_str()),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, format!("{:0<2}", f)),
        None => (digits, "00".to_string()),
    };

    let mut grouped = String::new();
    let chars: Vec<char> = int_part.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            grouped.push('\u{202F}');
        }
        grouped.push(*c);
    }

    format!("{}{},{} {}", sign, grouped, frac_part, currency)
}

fn money(value: BigDecimal, currency: &str) -> MoneyView {
    let formatted = format_amount(&value, currency);
    MoneyView { value, formatted }
}

// ── Aggregation ───────────────────────────────────────────────────────────────

fn sum_amounts<'a, I: Iterator<Item = &'a StatementTransaction>>(iter: I) -> BigDecimal {
    iter.fold(BigDecimal::zero(), |acc, tx| acc + &tx.amount)
}

fn year_series(
    transactions: &[StatementTransaction],
    window: (NaiveDate, NaiveDate),
    currency: &str,
) -> (YearSeries, BigDecimal) {
    let mut years: BTreeMap<i32, BTreeMap<u32, BigDecimal>> = BTreeMap::new();
    let mut attributed = BigDecimal::zero();

    for tx in transactions {
        let Some(date) = tx.value_date.map(|d| d.date_naive()) else {
            continue;
        };
        if !in_window(date, window) {
            continue;
        }
        attributed += &tx.amount;
        *years
            .entry(date.year())
            .or_default()
            .entry(date.month0())
            .or_insert_with(BigDecimal::zero) += &tx.amount;
    }

    let years = years
        .into_iter()
        .map(|(year, months)| {
            let total = months.values().fold(BigDecimal::zero(), |acc, v| acc + v);
            let months = months
                .into_iter()
                .map(|(month, value)| MonthBucket {
                    month,
                    label: MONTH_LABELS[month as usize].to_string(),
                    formatted: format_amount(&value, currency),
                    value,
                })
                .collect();
            YearBucket {
                year,
                total: money(total, currency),
                months,
            }
        })
        .collect();

    (YearSeries { years }, attributed)
}

/// First day of the month eleven months before the reference date
fn trailing_window_start(reference: NaiveDate) -> NaiveDate {
    let months0 = reference.year() * 12 + reference.month0() as i32 - 11;
    let year = months0.div_euclid(12);
    let month = months0.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).expect("derived first of month")
}

fn trailing_twelve_months(
    revenue: &[StatementTransaction],
    window: (NaiveDate, NaiveDate),
    currency: &str,
) -> TrailingTwelveMonths {
    let reference = revenue
        .iter()
        .filter_map(|tx| tx.value_date.map(|d| d.date_naive()))
        .filter(|d| in_window(*d, window))
        .max();

    let Some(reference) = reference else {
        return TrailingTwelveMonths {
            value: BigDecimal::zero(),
            formatted: format_amount(&BigDecimal::zero(), currency),
            reference_period_end: None,
        };
    };

    let start = trailing_window_start(reference);
    let value = sum_amounts(revenue.iter().filter(|tx| {
        tx.value_date
            .map(|d| {
                let d = d.date_naive();
                d >= start && d <= reference
            })
            .unwrap_or(false)
    }));

    TrailingTwelveMonths {
        formatted: format_amount(&value, currency),
        value,
        reference_period_end: Some(reference),
    }
}

fn build_stats(
    revenue: &[StatementTransaction],
    non_revenue: &[StatementTransaction],
    revenue_delta: BigDecimal,
    non_revenue_delta: BigDecimal,
) -> ReportStats {
    let all = revenue.iter().chain(non_revenue.iter());
    let mut agent_reviewed = 0;
    let mut agent_decisions = 0;
    let mut unresolved = 0;
    for tx in all {
        match tx.source {
            ClassificationSource::Agent => {
                agent_reviewed += 1;
                agent_decisions += 1;
            }
            ClassificationSource::AgentMissing => {
                agent_reviewed += 1;
                unresolved += 1;
            }
            ClassificationSource::Heuristic => {}
        }
    }

    ReportStats {
        total: revenue.len() + non_revenue.len(),
        auto_revenue: revenue
            .iter()
            .filter(|tx| tx.source == ClassificationSource::Heuristic)
            .count(),
        agent_reviewed,
        agent_decisions,
        unresolved,
        revenue_outside_months: revenue_delta,
        non_revenue_outside_months: non_revenue_delta,
    }
}

/// Aggregate the classified sets into the structured report.
pub fn build_report(
    revenue: &[StatementTransaction],
    non_revenue: &[StatementTransaction],
    currency: &str,
    now: DateTime<Utc>,
) -> StructuredReport {
    let window = aggregation_window(now);

    let revenue_total = sum_amounts(revenue.iter());
    let non_revenue_total = sum_amounts(non_revenue.iter());

    let (revenue_years, revenue_attributed) = year_series(revenue, window, currency);
    let (non_revenue_years, non_revenue_attributed) = year_series(non_revenue, window, currency);

    let revenue_delta = &revenue_total - &revenue_attributed;
    let non_revenue_delta = &non_revenue_total - &non_revenue_attributed;

    let stats = build_stats(revenue, non_revenue, revenue_delta, non_revenue_delta);
    let trailing = trailing_twelve_months(revenue, window, currency);

    StructuredReport {
        currency: currency.to_string(),
        generated_at: now,
        totals: ReportTotals {
            revenue: money(revenue_total, currency),
            non_revenue: money(non_revenue_total, currency),
        },
        revenue: revenue_years,
        non_revenue: non_revenue_years,
        trailing_twelve_months: trailing,
        stats,
    }
}

// ── Text rendering ────────────────────────────────────────────────────────────

fn render_series(out: &mut String, title: &str, series: &YearSeries) {
    out.push_str(title);
    out.push('\n');
    if series.years.is_empty() {
        out.push_str("  (no dated entries)\n");
        return;
    }
    for year in &series.years {
        out.push_str(&format!("  {} — {}\n", year.year, year.total.formatted));
        for month in &year.months {
            out.push_str(&format!("    {}: {}\n", month.label, month.formatted));
        }
    }
}

/// Human-readable rendering of a structured report. Pure function: the text
/// carries no information of its own.
pub fn render_report_text(report: &StructuredReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("Statement analysis report ({})\n", report.currency));
    out.push_str(&format!(
        "Generated at: {}\n\n",
        report.generated_at.format("%Y-%m-%dT%H:%M:%SZ")
    ));

    out.push_str(&format!(
        "Revenue total: {}\n",
        report.totals.revenue.formatted
    ));
    out.push_str(&format!(
        "Non-revenue total: {}\n",
        report.totals.non_revenue.formatted
    ));

    match report.trailing_twelve_months.reference_period_end {
        Some(end) => out.push_str(&format!(
            "Trailing 12 months revenue: {} (through {})\n\n",
            report.trailing_twelve_months.formatted, end
        )),
        None => out.push_str(&format!(
            "Trailing 12 months revenue: {}\n\n",
            report.trailing_twelve_months.formatted
        )),
    }

    render_series(&mut out, "Revenue by month:", &report.revenue);
    out.push('\n');
    render_series(&mut out, "Non-revenue by month:", &report.non_revenue);
    out.push('\n');

    let stats = &report.stats;
    out.push_str(&format!(
        "Transactions: {} total; {} keyword revenue; {} sent for review; {} agent decisions; {} unresolved\n",
        stats.total, stats.auto_revenue, stats.agent_reviewed, stats.agent_decisions, stats.unresolved
    ));

    if !stats.revenue_outside_months.is_zero() {
        out.push_str(&format!(
            "Revenue outside the month tables (undated or out of range): {}\n",
            format_amount(&stats.revenue_outside_months, &report.currency)
        ));
    }
    if !stats.non_revenue_outside_months.is_zero() {
        out.push_str(&format!(
            "Non-revenue outside the month tables (undated or out of range): {}\n",
            format_amount(&stats.non_revenue_outside_months, &report.currency)
        ));
    }

    out
}
