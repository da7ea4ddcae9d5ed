//! Value normalizers: canonical decimals and UTC instants from the
//! heterogeneous strings and numbers statement extractors emit.
//!
//! Extractor output is a list of untyped key/value records with multilingual
//! keys, mixed date locales, thousands-formatted numerals and Excel serial
//! dates. Everything downstream of the extractor goes through this module
//! first.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Epoch milliseconds for 2000-01-01T00:00:00Z; smaller numbers are never
/// treated as millisecond timestamps.
const EPOCH_MILLIS_FLOOR: f64 = 946_684_800_000.0;

const STRIPPED_SPACES: &[char] = &[' ', '\u{00A0}', '\u{202F}', '\u{2009}', '\u{2007}'];
const APOSTROPHES: &[char] = &['\'', '\u{2019}', '`'];

// ── Amount parsing ────────────────────────────────────────────────────────────

/// Parse an amount string into a decimal.
///
/// Handles grouped thousands (spaces, apostrophes, either `,` or `.`),
/// comma and dot decimal conventions, currency letters and symbols, leading
/// signs and parenthesized negatives. Unparseable input yields 0.
pub fn parse_amount(raw: &str) -> BigDecimal {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return BigDecimal::from(0);
    }

    let mut negative = false;
    let mut body = trimmed;
    if body.starts_with('(') && body.ends_with(')') && body.len() > 2 {
        negative = true;
        body = &body[1..body.len() - 1];
    }

    let mut cleaned = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '0'..='9' | ',' | '.' | '+' | '-' => cleaned.push(c),
            c if STRIPPED_SPACES.contains(&c) || APOSTROPHES.contains(&c) => {}
            c if c.is_alphabetic() => {}
            _ => {}
        }
    }

    let cleaned = match cleaned.strip_prefix('-') {
        Some(rest) => {
            negative = true;
            rest.to_string()
        }
        None => cleaned.strip_prefix('+').unwrap_or(&cleaned).to_string(),
    };

    let normalized = normalize_separators(&cleaned);
    let value = BigDecimal::from_str(&normalized).unwrap_or_else(|_| BigDecimal::from(0));
    if negative {
        -value
    } else {
        value
    }
}

/// Resolve `,`/`.` into a single canonical `.` decimal separator.
///
/// With both present the rightmost is the decimal separator. With one kind
/// present it is decimal only when the fractional tail is 1-2 digits and
/// either the separator is `,` or it occurs exactly once; otherwise it is a
/// thousands separator and is dropped.
fn normalize_separators(s: &str) -> String {
    let has_comma = s.contains(',');
    let has_dot = s.contains('.');

    if has_comma && has_dot {
        let last_comma = s.rfind(',').unwrap();
        let last_dot = s.rfind('.').unwrap();
        let decimal_pos = last_comma.max(last_dot);
        let mut out = String::with_capacity(s.len());
        for (i, c) in s.char_indices() {
            match c {
                ',' | '.' if i == decimal_pos => out.push('.'),
                ',' | '.' => {}
                c => out.push(c),
            }
        }
        return out;
    }

    if has_comma || has_dot {
        let sep = if has_comma { ',' } else { '.' };
        let last = s.rfind(sep).unwrap();
        let count = s.matches(sep).count();
        let tail_len = s.len() - last - 1;
        let is_decimal = (1..=2).contains(&tail_len) && (sep == ',' || count == 1);

        let mut out = String::with_capacity(s.len());
        for (i, c) in s.char_indices() {
            if c == sep {
                if is_decimal && i == last {
                    out.push('.');
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }

    s.to_string()
}

// ── Date parsing ──────────────────────────────────────────────────────────────

/// Parse a date string into a UTC instant.
///
/// Accepts ISO 8601, `dd.mm.yyyy` with optional `HH:MM[:SS]`, `mm.dd.yyyy`
/// (auto-detected when a slot exceeds 12), `dd <russian month> yyyy`,
/// incomplete `.mm.yyyy` (first of month), two-digit years (>70 is 19xx),
/// Excel serial dates and epoch milliseconds.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
    }

    if let Some(dt) = dotted_date(s) {
        return Some(dt);
    }

    if let Ok(n) = s.parse::<f64>() {
        return numeric_date(n);
    }

    None
}

/// Interpret a bare number as a date: epoch milliseconds when it is large
/// enough to fall on or after 2000-01-01, otherwise an Excel serial day.
pub fn numeric_date(n: f64) -> Option<DateTime<Utc>> {
    if n >= EPOCH_MILLIS_FLOOR {
        return Utc.timestamp_millis_opt(n as i64).single();
    }
    excel_serial_date(n)
}

/// Days since 1899-12-30, fractional part is time of day. Only plausible
/// years ([1990, current + 1]) are accepted.
pub fn excel_serial_date(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() || n <= 0.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = base.checked_add_signed(Duration::days(n.trunc() as i64))?;
    let current_year = Utc::now().year();
    if date.year() < 1990 || date.year() > current_year + 1 {
        return None;
    }
    let secs = ((n.fract()) * 86_400.0).round() as u32;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(secs.min(86_399), 0)?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

fn expand_year(year: i32) -> i32 {
    if year < 100 {
        if year > 70 {
            1900 + year
        } else {
            2000 + year
        }
    } else {
        year
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let hour: u32 = parts[0].parse().ok()?;
    let minute: u32 = parts[1].parse().ok()?;
    let second: u32 = parts.get(2).map_or(Some(0), |p| p.parse().ok())?;
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn russian_month(token: &str) -> Option<u32> {
    let lower = token.to_lowercase();
    let prefix: String = lower.chars().take(3).collect();
    let month = match prefix.as_str() {
        "янв" => 1,
        "фев" => 2,
        "мар" => 3,
        "апр" => 4,
        "май" | "мая" => 5,
        "июн" => 6,
        "июл" => 7,
        "авг" => 8,
        "сен" => 9,
        "окт" => 10,
        "ноя" => 11,
        "дек" => 12,
        _ => return None,
    };
    Some(month)
}

fn dotted_date(s: &str) -> Option<DateTime<Utc>> {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    // "4 марта 2024" / "4 марта 2024 г."
    if tokens.len() >= 3 {
        if let (Ok(day), Some(month)) = (tokens[0].parse::<u32>(), russian_month(tokens[1])) {
            let year_digits: String = tokens[2].chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(year) = year_digits.parse::<i32>() {
                let date = NaiveDate::from_ymd_opt(expand_year(year), month, day)?;
                return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
            }
        }
    }

    let date = dotted_ymd(tokens[0])?;
    let time = tokens
        .get(1)
        .and_then(|t| parse_time(t))
        .unwrap_or(NaiveTime::MIN);
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

fn dotted_ymd(s: &str) -> Option<NaiveDate> {
    let pieces: Vec<&str> = s.split('.').collect();
    if pieces.len() != 3 {
        return None;
    }

    // ".mm.yyyy" resolves to the first of the month
    let day: u32 = if pieces[0].is_empty() {
        1
    } else {
        pieces[0].parse().ok()?
    };
    let month: u32 = pieces[1].parse().ok()?;
    let year: i32 = pieces[2].parse().ok()?;
    let year = expand_year(year);

    // mm.dd.yyyy slips through some extractors; detectable when the
    // second slot exceeds 12
    let (day, month) = if day <= 12 && month > 12 {
        (month, day)
    } else {
        (day, month)
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

// ── Record field extraction ───────────────────────────────────────────────────

/// Field roles the extraction protocol understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Purpose,
    Sender,
    Correspondent,
    Bin,
}

const DATE_PRIORITY_KEYS: &[&str] = &[
    "дата операции",
    "дата платежа",
    "дата документа",
    "дата проводки",
    "дата",
    "operation date",
    "operation_date",
    "payment date",
    "payment_date",
    "value date",
    "value_date",
    "date",
    "та",
];

const PURPOSE_KEYS: &[&str] = &[
    "назначение платежа",
    "назначение",
    "описание операции",
    "описание",
    "детали платежа",
    "purpose",
    "description",
    "details",
    "narrative",
    "комментарий",
];

const SENDER_KEYS: &[&str] = &[
    "наименование отправителя",
    "отправитель",
    "плательщик",
    "sender",
    "payer",
    "from",
];

const CORRESPONDENT_KEYS: &[&str] = &[
    "корреспондент",
    "контрагент",
    "получатель",
    "counterparty",
    "correspondent",
    "beneficiary",
];

const BIN_KEYS: &[&str] = &["бин/иин", "бин", "иин", "инн", "bin", "iin", "tax id"];

const AMOUNT_KEYS: &[&str] = &[
    "сумма в валюте счета",
    "сумма операции",
    "сумма платежа",
    "сумма",
    "кредит",
    "приход",
    "поступление",
    "credit amount",
    "credit",
    "amount",
    "sum",
];

/// Keys the pipeline itself injects; never swept for dates
const INTERNAL_KEYS: &[&str] = &["source_file", "internal_id", "row_index"];

fn keys_for(role: FieldRole) -> &'static [&'static str] {
    match role {
        FieldRole::Purpose => PURPOSE_KEYS,
        FieldRole::Sender => SENDER_KEYS,
        FieldRole::Correspondent => CORRESPONDENT_KEYS,
        FieldRole::Bin => BIN_KEYS,
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Sweep the record's keys for a role, exact matches before containment.
pub fn extract_text(record: &Map<String, Value>, role: FieldRole) -> Option<String> {
    let keys = keys_for(role);

    for wanted in keys {
        for (key, value) in record {
            if key.trim().to_lowercase() == *wanted {
                if let Some(text) = value_to_text(value) {
                    return Some(normalize_text(&text));
                }
            }
        }
    }
    for wanted in keys {
        for (key, value) in record {
            if key.trim().to_lowercase().contains(wanted) {
                if let Some(text) = value_to_text(value) {
                    return Some(normalize_text(&text));
                }
            }
        }
    }
    None
}

/// Find the credit amount: returns the raw representation and the parsed
/// decimal. The raw form is preserved for the report and for the LLM.
pub fn extract_amount(record: &Map<String, Value>) -> Option<(String, BigDecimal)> {
    for wanted in AMOUNT_KEYS {
        for (key, value) in record {
            let key_l = key.trim().to_lowercase();
            if key_l == *wanted || key_l.contains(wanted) {
                match value {
                    Value::Number(n) => {
                        let raw = n.to_string();
                        let parsed = parse_amount(&raw);
                        return Some((raw, parsed));
                    }
                    Value::String(s) if !s.trim().is_empty() => {
                        return Some((s.clone(), parse_amount(s)));
                    }
                    _ => {}
                }
            }
        }
    }
    None
}

/// Find the transaction date: canonical keys first, then a value scan over
/// every non-internal field. Extractors sometimes emit the date only inside
/// free-text purpose fields, so the fallback is load-bearing.
pub fn extract_date(record: &Map<String, Value>) -> Option<DateTime<Utc>> {
    for wanted in DATE_PRIORITY_KEYS {
        for (key, value) in record {
            let key_l = key.trim().to_lowercase();
            if key_l == *wanted || key_l.contains(wanted) {
                if let Some(dt) = date_from_value(value) {
                    if date_year_plausible(&dt) {
                        return Some(dt);
                    }
                }
            }
        }
    }

    for (key, value) in record {
        let key_l = key.trim().to_lowercase();
        if key_l.starts_with('_') || INTERNAL_KEYS.contains(&key_l.as_str()) {
            continue;
        }
        if let Some(dt) = scan_value_for_date(value) {
            if date_year_plausible(&dt) {
                return Some(dt);
            }
        }
    }

    None
}

fn date_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_date(s),
        Value::Number(n) => n.as_f64().and_then(numeric_date),
        _ => None,
    }
}

fn scan_value_for_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Some(dt) = parse_date(s) {
                return Some(dt);
            }
            let tokens: Vec<&str> = s.split_whitespace().collect();
            for i in 0..tokens.len() {
                if i + 1 < tokens.len() {
                    if let Some(dt) = parse_date(&format!("{} {}", tokens[i], tokens[i + 1])) {
                        return Some(dt);
                    }
                }
                if let Some(dt) = parse_date(tokens[i]) {
                    return Some(dt);
                }
            }
            None
        }
        Value::Number(n) => n.as_f64().and_then(numeric_date),
        _ => None,
    }
}

fn date_year_plausible(dt: &DateTime<Utc>) -> bool {
    let year = dt.year();
    (2000..=Utc::now().year() + 2).contains(&year)
}

// ── Text normalization ────────────────────────────────────────────────────────

/// Collapse interior whitespace and trim; Unicode is preserved.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_amount_plain() {
        assert_eq!(parse_amount("500000"), dec("500000"));
        assert_eq!(parse_amount("0"), dec("0"));
    }

    #[test]
    fn test_parse_amount_grouped_spaces() {
        assert_eq!(parse_amount("1 234 567,89"), dec("1234567.89"));
        assert_eq!(parse_amount("1\u{00A0}234\u{00A0}567,89"), dec("1234567.89"));
        assert_eq!(parse_amount("1\u{202F}234\u{202F}567,89 KZT"), dec("1234567.89"));
        assert_eq!(parse_amount("1'234'567.89"), dec("1234567.89"));
    }

    #[test]
    fn test_parse_amount_both_separators() {
        assert_eq!(parse_amount("1,234,567.89"), dec("1234567.89"));
        assert_eq!(parse_amount("1.234.567,89"), dec("1234567.89"));
    }

    #[test]
    fn test_parse_amount_single_separator_rules() {
        // comma with short tail: decimal
        assert_eq!(parse_amount("12,34"), dec("12.34"));
        // comma with 3-digit tail: thousands
        assert_eq!(parse_amount("1,234"), dec("1234"));
        // dot once with short tail: decimal
        assert_eq!(parse_amount("12.5"), dec("12.5"));
        // dot repeated: thousands
        assert_eq!(parse_amount("1.234.567"), dec("1234567"));
        // comma repeated, short tail: decimal per the comma rule
        assert_eq!(parse_amount("1,234,56"), dec("1234.56"));
    }

    #[test]
    fn test_parse_amount_signs() {
        assert_eq!(parse_amount("-500"), dec("-500"));
        assert_eq!(parse_amount("+500"), dec("500"));
        assert_eq!(parse_amount("(1 000,50)"), dec("-1000.50"));
    }

    #[test]
    fn test_parse_amount_currency_tags() {
        assert_eq!(parse_amount("500 000 KZT"), dec("500000"));
        assert_eq!(parse_amount("500000тг"), dec("500000"));
    }

    #[test]
    fn test_parse_amount_unparseable_is_zero() {
        assert_eq!(parse_amount(""), dec("0"));
        assert_eq!(parse_amount("n/a"), dec("0"));
        assert_eq!(parse_amount("12-34"), dec("0"));
    }

    #[test]
    fn test_parse_date_iso() {
        let dt = parse_date("2024-03-04").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        let dt = parse_date("2024-03-04T12:30:00Z").unwrap();
        assert_eq!(dt.hour(), 12);
    }

    #[test]
    fn test_parse_date_dotted() {
        let dt = parse_date("04.03.2024").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());

        let dt = parse_date("04.03.2024 15:45").unwrap();
        assert_eq!(dt.hour(), 15);
        assert_eq!(dt.minute(), 45);

        let dt = parse_date("04.03.2024 15:45:30").unwrap();
        assert_eq!(dt.second(), 30);
    }

    #[test]
    fn test_parse_date_month_day_autodetect() {
        // second slot > 12 means mm.dd.yyyy
        let dt = parse_date("03.15.2024").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn test_parse_date_two_digit_year() {
        let dt = parse_date("04.03.24").unwrap();
        assert_eq!(dt.year(), 2024);
        let dt = parse_date("04.03.99").unwrap();
        assert_eq!(dt.year(), 1999);
    }

    #[test]
    fn test_parse_date_incomplete_month() {
        let dt = parse_date(".03.2024").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_parse_date_russian_textual() {
        let dt = parse_date("4 марта 2024").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        let dt = parse_date("15 мая 2023 г.").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2023, 5, 15).unwrap());
    }

    #[test]
    fn test_parse_date_excel_serial() {
        // 45355 = 2024-03-04
        let dt = parse_date("45355").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        // far out of the plausible year window
        assert!(excel_serial_date(1.0).is_none());
    }

    #[test]
    fn test_parse_date_epoch_millis() {
        let dt = parse_date("1709510400000").unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn test_extract_date_priority_keys() {
        let record = json!({
            "Дата операции": "04.03.2024",
            "Назначение платежа": "Оплата от 01.01.2020",
        });
        let dt = extract_date(record.as_object().unwrap()).unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn test_extract_date_value_scan_fallback() {
        let record = json!({
            "Назначение платежа": "Оплата по счету от 18.04.2024 за услуги",
            "Сумма": "750000",
        });
        let dt = extract_date(record.as_object().unwrap()).unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 4, 18).unwrap());
    }

    #[test]
    fn test_extract_date_skips_internal_keys() {
        let record = json!({
            "source_file": "stmt 04.03.2024.pdf",
            "Сумма": "x",
        });
        assert!(extract_date(record.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_extract_text_roles() {
        let record = json!({
            "Назначение платежа": "Оплата  по   СФ №12",
            "Отправитель": "ТОО Ромашка",
            "БИН/ИИН": "123456789012",
        });
        let record = record.as_object().unwrap();
        assert_eq!(
            extract_text(record, FieldRole::Purpose).as_deref(),
            Some("Оплата по СФ №12")
        );
        assert_eq!(
            extract_text(record, FieldRole::Sender).as_deref(),
            Some("ТОО Ромашка")
        );
        assert_eq!(
            extract_text(record, FieldRole::Bin).as_deref(),
            Some("123456789012")
        );
        assert!(extract_text(record, FieldRole::Correspondent).is_none());
    }

    #[test]
    fn test_extract_amount_prefers_named_columns() {
        let record = json!({
            "Сумма": "500 000",
            "Назначение платежа": "Оплата",
        });
        let (raw, parsed) = extract_amount(record.as_object().unwrap()).unwrap();
        assert_eq!(raw, "500 000");
        assert_eq!(parsed, dec("500000"));
    }

    #[test]
    fn test_extract_amount_numeric_value() {
        let record = json!({ "credit": 1200000.5 });
        let (_, parsed) = extract_amount(record.as_object().unwrap()).unwrap();
        assert_eq!(parsed, dec("1200000.5"));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Оплата\n по \t СФ  "), "Оплата по СФ");
        assert_eq!(normalize_text(""), "");
    }
}
