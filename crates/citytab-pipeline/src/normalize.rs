//! Field normalization: raw scraped text into typed values.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use citytab_core::{strip_citations, CityId, Table, Value};
use regex::Regex;
use tracing::{debug, warn};

use crate::rules::NormalizeRule;

pub const SQ_MI_PER_SQ_KM: f64 = 0.386102;
pub const FEET_PER_METER: f64 = 3.28084;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?|\.\d+").expect("invalid regex: number"));
static KM2: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"km2|km²|km\x{a0}2").expect("invalid regex: km2"));
static DENSITY_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\s*sq|mi|km2|,").expect("invalid regex: density noise"));
static PAREN_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.*$").expect("invalid regex: paren tail"));
static FEET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"feet|ft|,").expect("invalid regex: feet"));
static RANGE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s*(?:to|-|–)\s*").expect("invalid regex: range separator"));
static LETTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z\s\x{a0}]+").expect("invalid regex: letters"));
static DATE_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[.*?\]|\s\(.*?\)|\(.*?$|,\s[a-z].*$|\s[a-z].*$|;\s[1-9].*?$|:[1-9].*?$")
        .expect("invalid regex: date noise")
});
static NOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]|\s?\(.*?\)|\(.*$").expect("invalid regex: notes"));
static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}").expect("invalid regex: year"));

// Month-and-year values are handled separately: chrono would read "March 1850" as
// "%B %d %Y" with day 18 of year 50.
const DATE_FORMATS: [&str; 5] = ["%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%Y-%m-%d", "%m/%d/%Y"];

/// Convert the reconciled raw table into typed values.
///
/// Every cell loses its citation markers first; columns with a rule in `rules` are then
/// coerced, all others become text. Coercion failures become `Value::Missing`.
pub fn normalize(table: Table<String>, rules: &BTreeMap<String, NormalizeRule>) -> Table<Value> {
    let mut missing = 0usize;
    let normalized = table.map_cells(|id, column, raw| {
        let text = strip_citations(&raw).trim().to_string();
        let value = match rules.get(column) {
            _ if text.is_empty() => Value::Empty,
            Some(rule) => normalize_value(*rule, &text, id, column),
            None => Value::text(text),
        };
        if value == Value::Missing {
            missing += 1;
        }
        value
    });
    debug!(missing, "normalized table");
    normalized
}

fn normalize_value(rule: NormalizeRule, text: &str, id: CityId, column: &str) -> Value {
    let value = match rule {
        NormalizeRule::Percentage => parse_percentage(text).map(Value::Float),
        NormalizeRule::Area => parse_area(text).map(Value::Float),
        NormalizeRule::AreaText => Some(Value::Text(
            parse_area_text(text).unwrap_or_else(|| text.to_string()),
        )),
        NormalizeRule::Density => parse_density(text).map(Value::Int),
        NormalizeRule::Integer => parse_integer(text).map(Value::Int),
        NormalizeRule::Location => Some(Value::text(parse_location(text))),
        NormalizeRule::Elevation => parse_elevation(text).map(Value::Int),
        NormalizeRule::Date => {
            let cleaned = clean_date(text);
            parse_date(&cleaned)
                .or_else(|| {
                    warn!(row = %id, column, raw = %text, "unrecognized date, falling back to year");
                    year_fallback(text)
                })
                .map(Value::Date)
        }
    };
    value.unwrap_or_else(|| {
        warn!(row = %id, column, raw = %text, rule = ?rule, "could not coerce value");
        Value::Missing
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn parse_number(text: &str) -> Option<f64> {
    text.replace(',', "").trim().parse().ok()
}

pub fn parse_percentage(text: &str) -> Option<f64> {
    let text = text.replace(['+', '%'], "").replace('\u{2212}', "-");
    text.trim().parse().ok()
}

/// Area in square miles; values marked as km² are converted.
pub fn parse_area(text: &str) -> Option<f64> {
    let primary = text.split('(').next().unwrap_or_default();
    let is_km2 = KM2.is_match(primary);
    let number = NUMBER.find(primary)?;
    let value = parse_number(number.as_str())?;
    Some(if is_km2 {
        round2(value * SQ_MI_PER_SQ_KM)
    } else {
        value
    })
}

/// Like [`parse_area`], but keeps the cleaned number as text unless it was converted.
pub fn parse_area_text(text: &str) -> Option<String> {
    let primary = text.split('(').next().unwrap_or_default();
    let number = NUMBER.find(primary)?.as_str().replace(',', "");
    if KM2.is_match(primary) {
        let value: f64 = number.parse().ok()?;
        Some(Value::Float(round2(value * SQ_MI_PER_SQ_KM)).to_string())
    } else {
        Some(number)
    }
}

pub fn parse_density(text: &str) -> Option<i64> {
    let text = DENSITY_NOISE.replace_all(text, "");
    parse_integer(&text)
}

/// Integer with thousands separators; decimal input is rounded.
pub fn parse_integer(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect::<String>()
        .replace('\u{2212}', "-");
    if let Ok(value) = digits.parse::<i64>() {
        return Some(value);
    }
    let value = digits.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(value.round() as i64)
}

/// Coordinates before the first `/`.
pub fn parse_location(text: &str) -> String {
    text.split('/').next().unwrap_or_default().trim().to_string()
}

/// Elevation in whole feet; meters are converted and ranges are averaged.
pub fn parse_elevation(text: &str) -> Option<i64> {
    let text = PAREN_TAIL.replace(text, "");
    let text = FEET.replace_all(&text, "");
    let text = RANGE_SEPARATOR.replace_all(&text, "${1},");
    let is_meters = text.contains('m');
    let text = LETTERS.replace_all(&text, "").replace('\u{2212}', "-");

    let mut points = Vec::new();
    for part in text.split(',').filter(|p| !p.is_empty()) {
        let mut value: f64 = part.parse().ok()?;
        if is_meters {
            value *= FEET_PER_METER;
        }
        points.push(value);
    }
    if points.is_empty() || points.len() > 2 {
        return None;
    }
    let mean = points.iter().sum::<f64>() / points.len() as f64;
    Some(mean.round() as i64)
}

/// Drop notes, parentheticals and trailing clauses from an incorporation date.
pub fn clean_date(text: &str) -> String {
    DATE_NOISE.replace_all(text, "").trim().to_string()
}

fn midnight(date: NaiveDate) -> Option<NaiveDateTime> {
    date.and_hms_opt(0, 0, 0)
}

fn plausible(date: NaiveDate) -> Option<NaiveDateTime> {
    if (1000..=9999).contains(&date.year()) {
        midnight(date)
    } else {
        None
    }
}

fn year_start(year: &str) -> Option<NaiveDateTime> {
    if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, 1, 1).and_then(midnight)
}

/// Full date parse of a cleaned incorporation value.
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    for format in DATE_FORMATS {
        if let Some(date) = NaiveDate::parse_from_str(text, format).ok().and_then(plausible) {
            return Some(date);
        }
    }
    NaiveDate::parse_from_str(&format!("1 {text}"), "%d %B %Y")
        .ok()
        .and_then(plausible)
        .or_else(|| year_start(text))
}

/// Year of the last four characters, else of the last four-digit run.
///
/// Works on the raw value with only citations and parentheticals removed, so trailing
/// clauses such as "; reincorporated 1900" still count.
pub fn year_fallback(raw: &str) -> Option<NaiveDateTime> {
    let text = NOTES.replace_all(raw, "");
    let text = text.trim();
    let tail: String = {
        let chars: Vec<char> = text.chars().collect();
        chars[chars.len().saturating_sub(4)..].iter().collect()
    };
    year_start(&tail).or_else(|| YEAR.find_iter(text).last().and_then(|m| year_start(m.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn elevation_ranges_are_averaged() {
        assert_eq!(parse_elevation("100 to 200 ft"), Some(150));
        assert_eq!(parse_elevation("100–200 ft (30–61 m)"), Some(150));
        assert_eq!(parse_elevation("−7 ft (−2 m)"), Some(-7));
        assert_eq!(parse_elevation("489 ft (149 m)"), Some(489));
        assert_eq!(parse_elevation("1,608 ft"), Some(1608));
        assert_eq!(parse_elevation("unknown"), None);
    }

    #[test]
    fn meters_convert_to_feet() {
        for meters in [149.0, 1609.0, 5.0] {
            let feet = parse_elevation(&format!("{meters} m ({} ft)", meters * 3.0)).unwrap();
            assert!((feet as f64 - meters * FEET_PER_METER).abs() <= 1.0, "{meters} m");
        }
    }

    #[test]
    fn square_kilometers_convert_to_square_miles() {
        for km2 in [778.3, 1216.0, 96.5] {
            let area = parse_area(&format!("{km2} km2 (1 sq mi)")).unwrap();
            assert!((area - km2 * SQ_MI_PER_SQ_KM).abs() <= 0.01, "{km2} km2");
        }
        assert_eq!(parse_area("1,216.0\u{a0}km²"), Some(469.5));
        assert_eq!(parse_area("300.5\u{a0}sq\u{a0}mi (778.3\u{a0}km2)"), Some(300.5));
    }

    #[test]
    fn area_text_keeps_the_cleaned_number() {
        assert_eq!(parse_area_text("1,216.0\u{a0}sq\u{a0}mi").as_deref(), Some("1216.0"));
        assert_eq!(parse_area_text("1,216.0\u{a0}km2").as_deref(), Some("469.5"));
        assert_eq!(parse_area_text("31.1\u{a0}km²").as_deref(), Some("12.01"));
        assert_eq!(parse_area_text("n/a"), None);
    }

    #[test]
    fn percentages_accept_unicode_minus() {
        assert_eq!(parse_percentage("−3.70%"), Some(-3.7));
        assert_eq!(parse_percentage("+11.89%"), Some(11.89));
        assert_eq!(parse_percentage("n/a"), None);
    }

    #[test]
    fn density_and_location_cleanup() {
        assert_eq!(parse_density("29,298/sq\u{a0}mi"), Some(29298));
        assert_eq!(parse_density("8,304.5/sq mi"), Some(8305));
        assert_eq!(
            parse_location("40.66°N 73.94°W / 40.66; -73.94"),
            "40.66°N 73.94°W"
        );
    }

    #[test]
    fn date_fallback_uses_the_last_year() {
        let raw = "1850 (town), 1900 (city)";
        assert_eq!(parse_date(&clean_date(raw)), None);
        assert_eq!(year_fallback(raw), Some(ymd(1900, 1, 1)));

        let raw = "1850; reincorporated 1900";
        assert_eq!(clean_date(raw), "1850;");
        assert_eq!(parse_date(&clean_date(raw)), None);
        assert_eq!(year_fallback(raw), Some(ymd(1900, 1, 1)));
        assert_eq!(year_fallback("1857[2] (as a town)"), Some(ymd(1857, 1, 1)));

        assert_eq!(year_fallback("Town 1832 City 1837 B"), Some(ymd(1837, 1, 1)));
        assert_eq!(year_fallback("never"), None);
    }

    #[test]
    fn full_dates_parse() {
        assert_eq!(parse_date(&clean_date("December 27, 1837[4]")), Some(ymd(1837, 12, 27)));
        assert_eq!(parse_date("14 March 1850"), Some(ymd(1850, 3, 14)));
        assert_eq!(parse_date("March 1850"), Some(ymd(1850, 3, 1)));
        assert_eq!(parse_date("Mar 1850"), Some(ymd(1850, 3, 1)));
        assert_eq!(parse_date("March 18, 50"), None);
        assert_eq!(parse_date("1850"), Some(ymd(1850, 1, 1)));
    }

    #[test]
    fn table_normalization_marks_failures_missing() {
        let table = Table::from_rows(
            vec!["rank".into(), "city".into(), "incorporated".into()],
            vec![
                vec!["1".into(), "Austin[a]".into(), "December 27, 1839".into()],
                vec!["x".into(), "Boise".into(), String::new()],
            ],
        )
        .unwrap();
        let rules = BTreeMap::from([
            ("rank".to_string(), NormalizeRule::Integer),
            ("incorporated".to_string(), NormalizeRule::Date),
        ]);
        let typed = normalize(table, &rules);
        assert_eq!(typed.get(CityId(0), "rank"), Some(&Value::Int(1)));
        assert_eq!(typed.get(CityId(0), "city"), Some(&Value::Text("Austin".into())));
        assert_eq!(
            typed.get(CityId(0), "incorporated"),
            Some(&Value::Date(ymd(1839, 12, 27)))
        );
        assert_eq!(typed.get(CityId(1), "rank"), Some(&Value::Missing));
        assert_eq!(typed.get(CityId(1), "incorporated"), Some(&Value::Empty));
    }
}
