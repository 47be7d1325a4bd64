//! Detail-page stages: infobox enrichment and lead-paragraph descriptions.

use std::sync::LazyLock;

use citytab_core::{CityId, Table, TableError, DESCRIPTION_COLUMN, LISTING_COLUMNS};
use citytab_extract::{parse_infobox, parse_lead_paragraph, DetailAttribute, ResolvedLinks};
use citytab_fetch::Fetcher;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Labels with more words than this are prose, not attributes.
pub const MAX_LABEL_WORDS: usize = 4;

static LABEL_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^•\s*|\[.*?\]").expect("invalid regex: label noise"));
static PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[()]").expect("invalid regex: parens"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichStats {
    pub enriched: usize,
    pub skipped: usize,
}

/// Column name for an infobox label, or `None` when the label should be ignored.
pub fn clean_label(label: &str) -> Option<String> {
    let label = LABEL_NOISE.replace_all(label.trim(), "");
    let label = PARENS.replace_all(&label, "");
    let words: Vec<&str> = label.split_whitespace().collect();
    if words.is_empty() || words.len() > MAX_LABEL_WORDS {
        return None;
    }
    let name = words.join(" ").to_lowercase();
    if LISTING_COLUMNS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

/// Write one record's attributes, creating columns as new labels appear.
/// Returns the number of cells written.
pub fn merge_attributes(
    table: &mut Table<String>,
    id: CityId,
    attributes: &[DetailAttribute],
) -> Result<usize, TableError> {
    let mut written = 0;
    for attribute in attributes {
        let Some(column) = clean_label(&attribute.label) else {
            continue;
        };
        if table.add_column(&column) {
            debug!(column = %column, row = %id, "discovered attribute column");
        }
        table.set(id, &column, attribute.value.trim().to_string())?;
        written += 1;
    }
    Ok(written)
}

/// Fetch each linked detail page in table order and merge its infobox into the record.
///
/// Unreachable pages and pages without a usable infobox are logged and skipped; the
/// record keeps empty cells for every discovered column.
pub async fn enrich(
    table: &mut Table<String>,
    links: &ResolvedLinks,
    fetcher: &dyn Fetcher,
) -> Result<EnrichStats, TableError> {
    let mut stats = EnrichStats::default();
    let ids: Vec<CityId> = table.ids().collect();

    for id in ids {
        let Some(url) = links.get(id) else {
            stats.skipped += 1;
            continue;
        };
        let html = match fetcher.fetch(url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(row = %id, %url, error = %err, "detail page fetch failed; skipping record");
                stats.skipped += 1;
                continue;
            }
        };
        let attributes = match parse_infobox(&html) {
            Ok(attributes) => attributes,
            Err(err) => {
                warn!(row = %id, %url, error = %err, "no usable infobox; skipping record");
                stats.skipped += 1;
                continue;
            }
        };
        let written = merge_attributes(table, id, &attributes)?;
        debug!(row = %id, written, "merged detail attributes");
        stats.enriched += 1;
    }

    info!(
        enriched = stats.enriched,
        skipped = stats.skipped,
        columns = table.columns().len(),
        "detail enrichment finished"
    );
    Ok(stats)
}

/// Append the `description` column from each detail page's lead paragraph.
/// Returns the number of records that received a description.
pub async fn describe(
    table: &mut Table<String>,
    links: &ResolvedLinks,
    fetcher: &dyn Fetcher,
) -> Result<usize, TableError> {
    table.add_column(DESCRIPTION_COLUMN);
    let ids: Vec<CityId> = table.ids().collect();
    let mut described = 0;

    for id in ids {
        let Some(url) = links.get(id) else {
            continue;
        };
        let html = match fetcher.fetch(url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(row = %id, %url, error = %err, "detail page fetch failed; empty description");
                continue;
            }
        };
        match parse_lead_paragraph(&html) {
            Ok(text) if !text.is_empty() => {
                table.set(id, DESCRIPTION_COLUMN, text)?;
                described += 1;
            }
            Ok(_) => warn!(row = %id, %url, "lead paragraph is empty"),
            Err(err) => warn!(row = %id, %url, error = %err, "no lead paragraph; empty description"),
        }
    }

    info!(described, "descriptions extracted");
    Ok(described)
}
