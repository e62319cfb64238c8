use chrono::{Datelike, Duration, NaiveDate};

const MONTHS: [(&str, u32); 24] = [
    ("januar", 1),
    ("februar", 2),
    ("marts", 3),
    ("april", 4),
    ("maj", 5),
    ("juni", 6),
    ("juli", 7),
    ("august", 8),
    ("september", 9),
    ("oktober", 10),
    ("november", 11),
    ("december", 12),
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("maj", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("okt", 10),
    ("nov", 11),
    ("dec", 12),
];

/// Parses the publication date shown on a listing card.
///
/// Understands "i dag", "i går", "for 3 dage siden", "10. aug", "15. september"
/// (and the English equivalents) plus ISO dates. Day-month dates without a year
/// resolve to the most recent such date not after `today`. Returns `None` when
/// the text cannot be read rather than guessing.
pub fn parse_listing_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let t = text.trim().to_lowercase();
    if t.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(&t, "%Y-%m-%d") {
        return Some(date);
    }
    match t.as_str() {
        "i dag" | "today" => return Some(today),
        "i går" | "i gaar" | "yesterday" => return today.pred_opt(),
        _ => {}
    }

    let digits: String = t
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let number: u32 = digits.parse().ok()?;

    if t.contains("dage siden") || t.contains("dag siden") || t.contains("days ago") || t.contains("day ago") {
        return today.checked_sub_signed(Duration::days(i64::from(number)));
    }

    let (_, rest) = t.split_once('.')?;
    let word: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect();
    let month = MONTHS
        .iter()
        .find(|(name, _)| *name == word)
        .map(|(_, month)| *month)?;

    match NaiveDate::from_ymd_opt(today.year(), month, number) {
        Some(date) if date <= today => Some(date),
        _ => NaiveDate::from_ymd_opt(today.year() - 1, month, number),
    }
}
