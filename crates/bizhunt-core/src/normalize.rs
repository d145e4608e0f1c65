//! Financial, niche and location normalization.
//!
//! Everything here is a pure function of its input: no I/O, no clock, no locale.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::{Amount, FieldValue, FinancialKind, Location, ParseError, Period, DEFAULT_CURRENCY};

const NUM: &str = r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?";
const UNIT: &str = r"(?:thousand|million|billion|mm|bn|k|m|b)\b";
const CURRENCY_MARK: &str = r"(?:(?:c|ca|a|au)?[$€£]|\b(?:usd|eur|gbp|cad|aud)\b)";

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?P<ca>{CURRENCY_MARK})?\s*(?P<a>{NUM})\s*(?P<ua>{UNIT})?\s*(?:-|–|—|\bto\b)\s*(?P<cb>{CURRENCY_MARK})?\s*(?P<b>{NUM})\s*(?P<ub>{UNIT})?"
    ))
    .expect("range pattern compiles")
});

static CURRENCY_NUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){CURRENCY_MARK}\s*(?P<minus>-)?\s*(?P<n>{NUM})\s*(?P<u>{UNIT})?"
    ))
    .expect("currency pattern compiles")
});

static UNIT_NUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)(?P<n>{NUM})\s*(?P<u>{UNIT})")).expect("unit pattern compiles")
});

static PLAIN_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?P<n>{NUM})")).expect("number pattern compiles"));

static UNDISCLOSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[^a-z])(?:n/a|n\.a\.|na|undisclosed|not disclosed|confidential|contact|negotiable|upon request|tbd|none|not available|call)(?:$|[^a-z])",
    )
    .expect("undisclosed pattern compiles")
});

static DASH_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\-–—]+$").expect("dash pattern compiles"));

static CURRENCY_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(usd|eur|gbp|cad|aud)\b").expect("code pattern compiles"));

static CAD_SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|[^a-z])ca?\$").expect("cad pattern compiles"));

static AUD_SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|[^a-z])au?\$").expect("aud pattern compiles"));

static MONTHLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/\s*mo\b|/\s*month|\bper\s+month\b|\bmonthly\b|\ba\s+month\b|\bmo\.|\bmrr\b")
        .expect("monthly pattern compiles")
});

static ANNUAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)/\s*yr\b|/\s*year|\bper\s+year\b|\bannual(?:ly)?\b|\byearly\b|\bttm\b|\barr\b|\ba\s+year\b|\bper\s+annum\b",
    )
    .expect("annual pattern compiles")
});

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn unit_multiplier(unit: Option<&str>) -> f64 {
    match unit.map(|u| u.to_ascii_lowercase()).as_deref() {
        Some("k" | "thousand") => 1e3,
        Some("m" | "mm" | "million") => 1e6,
        Some("b" | "bn" | "billion") => 1e9,
        _ => 1.0,
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite())
}

fn scaled(caps: &Captures<'_>, num: &str, unit: &str) -> Option<f64> {
    let value = parse_number(caps.name(num)?.as_str())?;
    Some(value * unit_multiplier(caps.name(unit).map(|m| m.as_str())))
}

fn detect_currency(text: &str) -> String {
    if let Some(caps) = CURRENCY_CODE_RE.captures(text) {
        return caps[1].to_ascii_uppercase();
    }
    if CAD_SYMBOL_RE.is_match(text) {
        return "CAD".to_string();
    }
    if AUD_SYMBOL_RE.is_match(text) {
        return "AUD".to_string();
    }
    if text.contains('€') {
        return "EUR".to_string();
    }
    if text.contains('£') {
        return "GBP".to_string();
    }
    DEFAULT_CURRENCY.to_string()
}

fn detect_period(text: &str) -> Period {
    if MONTHLY_RE.is_match(text) {
        Period::Monthly
    } else if ANNUAL_RE.is_match(text) {
        Period::Annual
    } else {
        Period::Unspecified
    }
}

/// A range counts only when one of its ends carries a currency mark or a unit;
/// bare spans like `2023-2024` or `555-1234` are not amounts.
fn marked_range(text: &str) -> Option<f64> {
    for caps in RANGE_RE.captures_iter(text) {
        if !["ca", "ua", "cb", "ub"].iter().any(|g| caps.name(g).is_some()) {
            continue;
        }
        let (Some(low_raw), Some(high)) = (parse_number(&caps["a"]), scaled(&caps, "b", "ub")) else {
            continue;
        };
        let high_raw = parse_number(&caps["b"]).unwrap_or(high);
        // `$1-2M` shares the unit; `$500 - $2M` does not.
        let shares_unit = caps.name("ua").is_none() && caps.name("cb").is_none() && low_raw <= high_raw;
        let low_unit = caps
            .name("ua")
            .or_else(|| if shares_unit { caps.name("ub") } else { None })
            .map(|m| m.as_str());
        let low = low_raw * unit_multiplier(low_unit);
        return Some((low + high) / 2.0);
    }
    None
}

/// `-$50,000`, `$-50,000` and the accounting form `($50,000)`.
fn is_negated(text: &str, caps: &Captures<'_>, accounting: bool) -> bool {
    if caps.name("minus").is_some() {
        return true;
    }
    let Some(whole) = caps.get(0) else {
        return false;
    };
    let before = text[..whole.start()].trim_end();
    let after = text[whole.end()..].trim_start();
    if accounting && before.ends_with('(') && after.starts_with(')') {
        return true;
    }
    match before.strip_suffix('-') {
        Some(rest) => !rest.trim_end().ends_with(|c: char| c.is_ascii_alphanumeric()),
        None => false,
    }
}

fn signed_match(text: &str, pattern: &Regex, accounting: bool) -> Option<f64> {
    let caps = pattern.captures(text)?;
    let value = scaled(&caps, "n", "u")?;
    Some(if is_negated(text, &caps, accounting) { -value } else { value })
}

/// Amounts carrying a currency mark or unit, most specific first.
fn extract_marked(text: &str) -> Option<(f64, bool)> {
    if let Some(mid) = marked_range(text) {
        return Some((mid, true));
    }
    signed_match(text, &CURRENCY_NUM_RE, true)
        .or_else(|| signed_match(text, &UNIT_NUM_RE, false))
        .map(|value| (value, false))
}

/// Parse one financial string.
///
/// `Ok(None)` for empty or explicitly undisclosed values, `Err` when the text
/// carries something but no pattern recognises it.
pub fn parse_amount(raw: &str, kind: FinancialKind) -> Result<Option<Amount>, ParseError> {
    let text = raw.trim();
    if text.is_empty() || DASH_ONLY_RE.is_match(text) {
        return Ok(None);
    }
    let extracted = match extract_marked(text) {
        Some(found) => Some(found),
        // Without a marked amount, a disclosure phrase outranks stray digits.
        None if UNDISCLOSED_RE.is_match(text) => return Ok(None),
        None => signed_match(text, &PLAIN_NUM_RE, false).map(|value| (value, false)),
    };
    if let Some((value, range_derived)) = extracted {
        return Ok(Some(Amount {
            value: round2(value),
            currency: detect_currency(text),
            period: detect_period(text),
            range_derived,
        }));
    }
    Err(ParseError {
        kind,
        raw: text.to_string(),
    })
}

/// Normalize an optional raw financial string into a tagged field value.
pub fn normalize_financial(raw: Option<&str>, kind: FinancialKind) -> FieldValue<Amount> {
    let Some(raw) = raw else {
        return FieldValue::Absent;
    };
    match parse_amount(raw, kind) {
        Ok(Some(amount)) => FieldValue::Present(amount),
        Ok(None) => FieldValue::Absent,
        Err(err) => FieldValue::ParseFailed(err.raw),
    }
}

/// Collapse whitespace; empty text is absent.
pub fn clean_text(raw: Option<&str>) -> FieldValue<String> {
    let Some(raw) = raw else {
        return FieldValue::Absent;
    };
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        FieldValue::Absent
    } else {
        FieldValue::Present(cleaned)
    }
}

const NICHE_MAPPING: &[(&str, &str)] = &[
    ("amazon fba", "Amazon FBA"),
    ("amazon", "Amazon FBA"),
    ("fba", "Amazon FBA"),
    ("ecommerce", "E-commerce"),
    ("e-commerce", "E-commerce"),
    ("saas", "SaaS"),
    ("software", "SaaS"),
    ("content", "Content"),
    ("blog", "Content"),
    ("affiliate", "Affiliate Marketing"),
    ("dropshipping", "Dropshipping"),
    ("wholesale", "Wholesale"),
    ("retail", "Retail"),
    ("marketplace", "Marketplace"),
    ("service", "Service Business"),
    ("consulting", "Consulting"),
    ("digital marketing", "Digital Marketing"),
    ("seo", "SEO"),
    ("advertising", "Advertising"),
];

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Map free-form niche labels onto the canonical niche vocabulary.
pub fn normalize_niches<S: AsRef<str>>(raw: &[S]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for niche in raw {
        let clean = niche.as_ref().trim().to_lowercase();
        if clean.is_empty() {
            continue;
        }
        let mapped = NICHE_MAPPING
            .iter()
            .find(|(key, _)| *key == clean)
            .or_else(|| NICHE_MAPPING.iter().find(|(key, _)| clean.contains(key)))
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or_else(|| title_case(&clean));
        out.insert(mapped);
    }
    out
}

const US_STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"), ("AK", "Alaska"), ("AZ", "Arizona"), ("AR", "Arkansas"),
    ("CA", "California"), ("CO", "Colorado"), ("CT", "Connecticut"), ("DE", "Delaware"),
    ("FL", "Florida"), ("GA", "Georgia"), ("HI", "Hawaii"), ("ID", "Idaho"),
    ("IL", "Illinois"), ("IN", "Indiana"), ("IA", "Iowa"), ("KS", "Kansas"),
    ("KY", "Kentucky"), ("LA", "Louisiana"), ("ME", "Maine"), ("MD", "Maryland"),
    ("MA", "Massachusetts"), ("MI", "Michigan"), ("MN", "Minnesota"), ("MS", "Mississippi"),
    ("MO", "Missouri"), ("MT", "Montana"), ("NE", "Nebraska"), ("NV", "Nevada"),
    ("NH", "New Hampshire"), ("NJ", "New Jersey"), ("NM", "New Mexico"), ("NY", "New York"),
    ("NC", "North Carolina"), ("ND", "North Dakota"), ("OH", "Ohio"), ("OK", "Oklahoma"),
    ("OR", "Oregon"), ("PA", "Pennsylvania"), ("RI", "Rhode Island"), ("SC", "South Carolina"),
    ("SD", "South Dakota"), ("TN", "Tennessee"), ("TX", "Texas"), ("UT", "Utah"),
    ("VT", "Vermont"), ("VA", "Virginia"), ("WA", "Washington"), ("WV", "West Virginia"),
    ("WI", "Wisconsin"), ("WY", "Wyoming"),
];

const INTERNATIONAL: &[(&str, &str)] = &[
    ("united states", "US"), ("usa", "US"),
    ("canada", "CA"), ("toronto", "CA"), ("vancouver", "CA"),
    ("united kingdom", "GB"), ("uk", "GB"), ("london", "GB"),
    ("australia", "AU"), ("sydney", "AU"), ("melbourne", "AU"),
    ("germany", "DE"), ("berlin", "DE"),
    ("france", "FR"), ("paris", "FR"),
];

static STATE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{2})\b").expect("state code pattern compiles"));

static STATE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    let mut names: Vec<&str> = US_STATES.iter().map(|(_, name)| *name).collect();
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));
    Regex::new(&format!(r"(?i)\b({})\b", names.join("|"))).expect("state name pattern compiles")
});

static INTERNATIONAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    let terms: Vec<&str> = INTERNATIONAL.iter().map(|(term, _)| *term).collect();
    Regex::new(&format!(r"(?i)\b({})\b", terms.join("|"))).expect("country pattern compiles")
});

fn city_before(raw: &str, state_start: usize) -> Option<String> {
    let prefix = raw[..state_start].trim_end_matches(|c: char| c == ',' || c.is_whitespace());
    let city = prefix.rsplit(',').next()?.trim();
    (!city.is_empty()).then(|| city.to_string())
}

/// Split a free-text location into country/state/city where recognisable.
pub fn normalize_location(raw: Option<&str>) -> Location {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Location::default();
    };

    let by_code = STATE_CODE_RE.captures_iter(raw).find_map(|caps| {
        let m = caps.get(1)?;
        US_STATES
            .iter()
            .find(|(code, _)| *code == m.as_str())
            .map(|(code, _)| (*code, m.start()))
    });
    let by_name = || {
        STATE_NAME_RE.find(raw).and_then(|m| {
            US_STATES
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(m.as_str()))
                .map(|(code, _)| (*code, m.start()))
        })
    };

    if let Some((code, start)) = by_code.or_else(by_name) {
        return Location {
            country: Some("US".to_string()),
            state: Some(code.to_string()),
            city: city_before(raw, start),
        };
    }

    let country = INTERNATIONAL_RE.find(raw).and_then(|m| {
        let found = m.as_str().to_lowercase();
        INTERNATIONAL
            .iter()
            .find(|(term, _)| *term == found)
            .map(|(_, code)| code.to_string())
    });
    Location {
        country,
        state: None,
        city: None,
    }
}
