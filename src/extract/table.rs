use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use super::{visible_lines, visible_text, OwnerRow};

const RESULT_KEYWORDS: [&str; 8] = [
    "owner", "ಮಾಲೀಕರ", "extent", "ವಿಸ್ತೀರ್ಣ", "khata", "ಖಾತಾ", "name", "ಹೆಸರು",
];

const FORM_KEYWORDS: [&str; 11] = [
    "select district",
    "select taluk",
    "select hobli",
    "select village",
    "select survey",
    "select surnoc",
    "select hissa",
    "select period",
    "toggle navigation",
    "ಜಿಲ್ಲೆ ಆಯ್ಕೆಮಾಡಿ",
    "ತಾಲ್ಲೂಕು ಆಯ್ಕೆಮಾಡಿ",
];

/// First cells that are labels or totals rather than owners
const NON_DATA_PHRASES: [&str; 8] = [
    "total", "ಒಟ್ಟು", "no records", "no data", "not found", "select", "owner", "name",
];

const RESULT_WEIGHT: i32 = 10;
const FORM_PENALTY: i32 = 50;
const CONTROL_PENALTY: i32 = 100;
const ROW_RANGE_WEIGHT: i32 = 5;
const EXTENT_WEIGHT: i32 = 15;

fn extent_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+[.\-]\d+[.\-]\d+").expect("valid extent pattern"))
}

fn serial_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(Sl\.?\s*No\.?|ಕ್ರಮ|ಸಂ|#|\d{1,3})$").expect("valid serial pattern")
    })
}

fn container_class_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)result|data|owner|record").expect("valid class pattern"))
}

fn labeled_owner_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:owner|name|ಮಾಲೀಕ)[^:\n]{0,20}[:\s]+([^\n,:]+)").expect("valid owner pattern")
    })
}

fn labeled_extent_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:extent|ವಿಸ್ತೀರ್ಣ)[^:\n]{0,20}[:\s]+([\d.\-]+)").expect("valid extent label pattern")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Owner,
    Extent,
    Khata,
}

fn header_column(cell: &str) -> Option<Column> {
    let lower = cell.to_lowercase();
    if lower.contains("khata") || lower.contains("ಖಾತ") {
        Some(Column::Khata)
    } else if lower.contains("extent") || lower.contains("ವಿಸ್ತೀರ್ಣ") || lower.contains("area") {
        Some(Column::Extent)
    } else if lower.contains("owner") || lower.contains("ಮಾಲೀಕ") || lower.contains("name") || lower.contains("ಹೆಸರು") {
        Some(Column::Owner)
    } else {
        None
    }
}

/// Pull owner rows out of a results page.
///
/// Every table is scored on result keywords, leftover form markup, row count
/// and extent-shaped cells; the best positive table is parsed. When no table
/// qualifies, result-styled containers are scanned for `label: value` text.
/// Malformed markup yields an empty list, never an error.
pub fn extract_owners(html: &str) -> Vec<OwnerRow> {
    let document = Html::parse_document(html);
    let Ok(table_selector) = Selector::parse("table") else {
        return Vec::new();
    };

    let best = document
        .select(&table_selector)
        .map(|table| (score_table(table), table))
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score);

    match best {
        Some((score, table)) => {
            debug!("Selected results table with score {}", score);
            parse_table(table)
        }
        None => {
            debug!("No results table scored positively, scanning containers");
            scan_containers(&document)
        }
    }
}

pub(crate) fn score_table(table: ElementRef<'_>) -> i32 {
    let text = visible_text(table).to_lowercase();
    let mut score = 0;

    score += RESULT_WEIGHT * RESULT_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as i32;
    score -= FORM_PENALTY * FORM_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as i32;

    if let Ok(controls) = Selector::parse("select, option, input, textarea") {
        if table.select(&controls).next().is_some() {
            score -= CONTROL_PENALTY;
        }
    }

    let rows = own_rows(table).len();
    if (2..=100).contains(&rows) {
        score += ROW_RANGE_WEIGHT;
    }

    if extent_pattern().is_match(&text) {
        score += EXTENT_WEIGHT;
    }

    score
}

/// Rows belonging to `table` itself, not to tables nested inside it
fn own_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let Ok(row_selector) = Selector::parse("tr") else {
        return Vec::new();
    };

    table
        .select(&row_selector)
        .filter(|row| {
            row.ancestors()
                .find(|node| node.value().as_element().map_or(false, |el| el.name() == "table"))
                .map_or(false, |owner| owner.id() == table.id())
        })
        .collect()
}

fn row_cells(row: ElementRef<'_>) -> Vec<String> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|cell| matches!(cell.value().name(), "td" | "th"))
        .map(visible_text)
        .collect()
}

fn parse_table(table: ElementRef<'_>) -> Vec<OwnerRow> {
    let rows: Vec<Vec<String>> = own_rows(table)
        .into_iter()
        .map(row_cells)
        .filter(|cells| !cells.is_empty())
        .collect();

    // Header may sit on the first or second row (a caption row sometimes precedes it)
    let mut header: Option<(usize, Vec<Option<Column>>)> = None;
    for (index, cells) in rows.iter().enumerate().take(2) {
        let columns: Vec<Option<Column>> = cells.iter().map(|c| header_column(c)).collect();
        if columns.contains(&Some(Column::Owner)) {
            header = Some((index, columns));
            break;
        }
    }

    let data_start = header.as_ref().map_or(0, |(index, _)| index + 1);
    let mut seen = HashSet::new();
    let mut owners = Vec::new();

    for cells in &rows[data_start.min(rows.len())..] {
        let row = match &header {
            Some((_, columns)) => mapped_row(cells, columns),
            None => positional_row(cells),
        };

        if let Some(row) = row {
            if seen.insert(row.clone()) {
                owners.push(row);
            }
        }
    }

    debug!("Extracted {} owner rows", owners.len());
    owners
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn mapped_row(cells: &[String], columns: &[Option<Column>]) -> Option<OwnerRow> {
    let pick = |wanted: Column| {
        columns
            .iter()
            .position(|c| *c == Some(wanted))
            .and_then(|index| non_empty(cells.get(index)))
    };

    let owner_name = pick(Column::Owner)?;
    if !is_usable_owner(&owner_name) {
        return None;
    }

    Some(OwnerRow {
        owner_name,
        extent: pick(Column::Extent),
        khata: pick(Column::Khata),
    })
}

fn positional_row(cells: &[String]) -> Option<OwnerRow> {
    // A leading serial-number cell is not data
    let skip = cells
        .first()
        .map_or(0, |first| serial_pattern().is_match(first.trim()) as usize);
    let usable: Vec<&String> = cells.iter().skip(skip).collect();

    let owner_name = usable.first().map(|c| c.trim().to_string())?;
    if !is_usable_owner(&owner_name) {
        return None;
    }

    let rest = &usable[1..];
    let extent_index = rest.iter().position(|c| extent_pattern().is_match(c));
    let extent = extent_index.and_then(|i| non_empty(rest.get(i).copied()));
    let khata = rest
        .iter()
        .enumerate()
        .find(|(i, c)| Some(*i) != extent_index && !c.trim().is_empty())
        .map(|(_, c)| c.trim().to_string());

    Some(OwnerRow { owner_name, extent, khata })
}

fn is_usable_owner(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || serial_pattern().is_match(trimmed) {
        return false;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit() || c.is_ascii_punctuation() || c.is_whitespace()) {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !NON_DATA_PHRASES.iter().any(|phrase| {
        lower == *phrase
            || lower
                .strip_prefix(phrase)
                .map_or(false, |rest| rest.starts_with(|c: char| !c.is_alphanumeric()))
    })
}

fn scan_containers(document: &Html) -> Vec<OwnerRow> {
    let Ok(selector) = Selector::parse("div[class]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut owners = Vec::new();

    for container in document.select(&selector) {
        let class = container.value().attr("class").unwrap_or("");
        if !container_class_pattern().is_match(class) {
            continue;
        }

        let text = visible_lines(container).join("\n");
        if text.chars().count() <= 50 {
            continue;
        }

        let extent = labeled_extent_pattern()
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());

        for capture in labeled_owner_pattern().captures_iter(&text) {
            let Some(name) = capture.get(1).map(|m| m.as_str().trim().to_string()) else {
                continue;
            };
            if !is_usable_owner(&name) {
                continue;
            }
            let row = OwnerRow {
                owner_name: name,
                extent: extent.clone(),
                khata: None,
            };
            if seen.insert(row.clone()) {
                owners.push(row);
            }
        }
    }

    owners
}
