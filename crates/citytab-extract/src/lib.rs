//! HTML extraction for citytab: the listing table, its city links, detail-page
//! information panels and lead paragraphs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use citytab_core::{strip_citations, CityId, Table, TableError, CITY_COLUMN, LISTING_COLUMNS};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "citytab-extract";

pub const LISTING_TABLE_SELECTOR: &str = "table.wikitable.sortable";
pub const INFOBOX_SELECTOR: &str = "table.infobox";
pub const CONTENT_SELECTOR: &str = "div.mw-parser-output";

/// Grid width of the listing table once spans are expanded.
pub const LISTING_GRID_WIDTH: usize = 11;
/// Square-kilometer duplicates of land area and density.
pub const LISTING_DROPPED_POSITIONS: [usize; 2] = [7, 9];

/// Label of the information-panel row that ends the presentational block.
pub const COUNTRY_LABEL: &str = "Country";

static DESCRIPTION_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s\(listen\)|\[.*?\]|\n|\x{a0}").expect("invalid regex: description noise")
});

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("no listing table matches {0:?}")]
    TableNotFound(&'static str),
    #[error("listing row {row} has {found} cells, expected {expected}")]
    ShapeMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("no information panel on the page")]
    InfoboxNotFound,
    #[error("information panel has no \"Country\" row")]
    MissingCountryRow,
    #[error("no article content container on the page")]
    ContentNotFound,
    #[error("no unclassed paragraph in the article content")]
    LeadParagraphNotFound,
    #[error(transparent)]
    Table(#[from] TableError),
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::InvalidSelector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// One cell of an expanded table grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCell {
    pub text: String,
    pub is_header: bool,
}

fn child_elements<'a>(element: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    element.children().filter_map(ElementRef::wrap)
}

fn table_rows<'a>(table: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    let mut rows = Vec::new();
    for child in child_elements(table) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => {
                rows.extend(child_elements(child).filter(|c| c.value().name() == "tr"))
            }
            _ => {}
        }
    }
    rows
}

fn span_attr(element: ElementRef<'_>, name: &str) -> usize {
    element
        .value()
        .attr(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
        .min(1000)
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => match el.name() {
                "br" => out.push(' '),
                "style" | "script" => {}
                _ => {
                    if let Some(child) = ElementRef::wrap(child) {
                        collect_text(child, out);
                    }
                }
            },
            _ => {}
        }
    }
}

/// Text of an element with `<br>` as a space and style/script content skipped.
pub fn element_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(element, &mut out);
    out
}

/// Collapse ASCII whitespace runs; non-breaking spaces are kept, unit cleanup relies on them.
fn collapse_ascii_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_ascii_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(ch);
        }
    }
    out
}

/// Turn a table element into rows of cells, expanding `colspan` and `rowspan`.
///
/// Rows of nested tables are not included.
pub fn table_grid(table: ElementRef<'_>) -> Vec<Vec<GridCell>> {
    let mut grid = Vec::new();
    let mut carried: Vec<Option<(GridCell, usize)>> = Vec::new();

    for tr in table_rows(table) {
        let mut row: Vec<GridCell> = Vec::new();
        let mut cells = child_elements(tr).filter(|c| matches!(c.value().name(), "th" | "td"));

        loop {
            let col = row.len();
            if let Some(slot) = carried.get_mut(col) {
                if let Some((cell, remaining)) = slot.take() {
                    row.push(cell.clone());
                    if remaining > 1 {
                        *slot = Some((cell, remaining - 1));
                    }
                    continue;
                }
            }

            let Some(element) = cells.next() else {
                if carried.iter().skip(col).any(Option::is_some) {
                    row.push(GridCell {
                        text: String::new(),
                        is_header: false,
                    });
                    continue;
                }
                break;
            };

            let cell = GridCell {
                text: collapse_ascii_whitespace(&element_text(element)),
                is_header: element.value().name() == "th",
            };
            let colspan = span_attr(element, "colspan");
            let rowspan = span_attr(element, "rowspan");
            for _ in 0..colspan {
                let col = row.len();
                if rowspan > 1 {
                    if carried.len() <= col {
                        carried.resize(col + 1, None);
                    }
                    carried[col] = Some((cell.clone(), rowspan - 1));
                }
                row.push(cell.clone());
            }
        }

        grid.push(row);
    }

    grid
}

/// A hyperlink found inside the listing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub text: String,
    pub href: String,
}

/// The listing table as base records plus the anchors of the same table region.
#[derive(Debug, Clone)]
pub struct ListingPage {
    pub table: Table<String>,
    pub anchors: Vec<Anchor>,
}

pub fn parse_listing(html: &str) -> Result<ListingPage, ExtractError> {
    let document = Html::parse_document(html);
    let table_sel = selector(LISTING_TABLE_SELECTOR)?;
    let table_el = document
        .select(&table_sel)
        .next()
        .ok_or(ExtractError::TableNotFound(LISTING_TABLE_SELECTOR))?;

    let mut grid = table_grid(table_el).into_iter();
    let header_width = grid.next().map(|row| row.len()).unwrap_or_default();
    if header_width != LISTING_GRID_WIDTH {
        return Err(ExtractError::ShapeMismatch {
            row: 0,
            expected: LISTING_GRID_WIDTH,
            found: header_width,
        });
    }

    let mut rows = Vec::new();
    for (i, cells) in grid.enumerate() {
        if cells.iter().all(|c| c.is_header) {
            debug!(row = i + 1, "skipping sub-header row");
            continue;
        }
        if cells.len() != LISTING_GRID_WIDTH {
            return Err(ExtractError::ShapeMismatch {
                row: i + 1,
                expected: LISTING_GRID_WIDTH,
                found: cells.len(),
            });
        }
        let mut values: Vec<String> = cells
            .into_iter()
            .enumerate()
            .filter(|(pos, _)| !LISTING_DROPPED_POSITIONS.contains(pos))
            .map(|(_, c)| c.text)
            .collect();
        values[1] = strip_citations(&values[1]).trim().to_string();
        rows.push(values);
    }

    let columns = LISTING_COLUMNS.iter().map(|c| c.to_string()).collect();
    let table = Table::from_rows(columns, rows)?;

    let anchor_sel = selector("a[href]")?;
    let anchors = table_el
        .select(&anchor_sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            Some(Anchor {
                text: a.text().collect::<String>().trim().to_string(),
                href: href.to_string(),
            })
        })
        .collect();

    Ok(ListingPage {
        table,
        anchors,
    })
}

/// Detail-page addresses keyed by the record they belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedLinks {
    pub by_city: BTreeMap<CityId, Url>,
    pub unresolved: Vec<CityId>,
}

impl ResolvedLinks {
    pub fn get(&self, id: CityId) -> Option<&Url> {
        self.by_city.get(&id)
    }
}

/// Map each record to the first anchor whose text equals its city name.
pub fn resolve_links(anchors: &[Anchor], table: &Table<String>, base: &Url) -> ResolvedLinks {
    let names: HashSet<&str> = table
        .column_cells(CITY_COLUMN)
        .map(|(_, name)| name.as_str())
        .collect();

    let mut by_name: HashMap<&str, Url> = HashMap::new();
    for anchor in anchors {
        let Some(name) = names.get(anchor.text.as_str()) else {
            continue;
        };
        if by_name.contains_key(name) {
            debug!(city = %anchor.text, href = %anchor.href, "ignoring repeated city link");
            continue;
        }
        match base.join(&anchor.href) {
            Ok(url) => {
                by_name.insert(*name, url);
            }
            Err(err) => warn!(city = %anchor.text, href = %anchor.href, error = %err, "unusable city link"),
        }
    }

    let mut resolved = ResolvedLinks::default();
    for (id, name) in table.column_cells(CITY_COLUMN) {
        match by_name.get(name.as_str()) {
            Some(url) => {
                resolved.by_city.insert(id, url.clone());
            }
            None => {
                warn!(row = %id, city = %name, "no detail link for city");
                resolved.unresolved.push(id);
            }
        }
    }
    resolved
}

/// One label/value row of an information panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailAttribute {
    pub label: String,
    pub value: String,
}

/// Label/value rows of the information panel that follow the `Country` row.
pub fn parse_infobox(html: &str) -> Result<Vec<DetailAttribute>, ExtractError> {
    let document = Html::parse_document(html);
    let infobox_sel = selector(INFOBOX_SELECTOR)?;
    let infobox = document
        .select(&infobox_sel)
        .next()
        .ok_or(ExtractError::InfoboxNotFound)?;

    let rows: Vec<DetailAttribute> = table_grid(infobox)
        .into_iter()
        .filter(|cells| !cells.is_empty())
        .map(|mut cells| {
            let value = if cells.len() > 1 {
                cells.swap_remove(1).text
            } else {
                String::new()
            };
            DetailAttribute {
                label: cells.swap_remove(0).text,
                value,
            }
        })
        .collect();

    let country = rows
        .iter()
        .position(|row| row.label.trim() == COUNTRY_LABEL)
        .ok_or(ExtractError::MissingCountryRow)?;

    Ok(rows.into_iter().skip(country + 1).collect())
}

/// Remove citations, line breaks, non-breaking spaces and the pronunciation annotation.
pub fn clean_description(text: &str) -> String {
    DESCRIPTION_NOISE.replace_all(text, "").trim().to_string()
}

/// First paragraph without a class attribute inside the article content, cleaned.
pub fn parse_lead_paragraph(html: &str) -> Result<String, ExtractError> {
    let document = Html::parse_document(html);
    let content_sel = selector(CONTENT_SELECTOR)?;
    let paragraph_sel = selector("p")?;
    let content = document
        .select(&content_sel)
        .next()
        .ok_or(ExtractError::ContentNotFound)?;
    let paragraph = content
        .select(&paragraph_sel)
        .find(|p| p.value().attr("class").is_none())
        .ok_or(ExtractError::LeadParagraphNotFound)?;
    Ok(clean_description(&element_text(paragraph)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><body>
<table class="wikitable sortable">
<tbody>
<tr><th rowspan="2">2024 rank</th><th rowspan="2">City</th><th rowspan="2">State</th>
<th rowspan="2">2024 estimate</th><th rowspan="2">2020 census</th><th rowspan="2">Change</th>
<th colspan="2">2020 land area</th><th colspan="2">2020 density</th><th rowspan="2">Location</th></tr>
<tr><th>sq mi</th><th>km<sup>2</sup></th><th>/ sq mi</th><th>/ km<sup>2</sup></th></tr>
<tr><td>1</td><td><a href="/wiki/New_York_City">New York</a><sup>[d]</sup></td>
<td><a href="/wiki/New_York_(state)">New York</a></td><td>8,478,072</td><td>8,804,190</td>
<td>−3.70%</td><td>300.5 sq mi</td><td>778.3 km<sup>2</sup></td><td>29,298/sq mi</td>
<td>11,312/km<sup>2</sup></td><td>40.66°N 73.94°W / 40.66; -73.94</td></tr>
<tr><td>2</td><td><a href="/wiki/Los_Angeles">Los Angeles</a></td>
<td><a href="/wiki/California">California</a></td><td>3,878,704</td><td>3,898,747</td>
<td>−0.51%</td><td>469.5 sq mi</td><td>1,216.0 km<sup>2</sup></td><td>8,304/sq mi</td>
<td>3,206/km<sup>2</sup></td><td>34.02°N 118.41°W / 34.02; -118.41</td></tr>
</tbody></table>
<p><a href="/wiki/Los_Angeles">Los Angeles</a> outside the table</p>
</body></html>"#;

    fn parse_fragment_table(html: &str) -> Vec<Vec<GridCell>> {
        let document = Html::parse_document(html);
        let sel = Selector::parse("table").unwrap();
        table_grid(document.select(&sel).next().unwrap())
    }

    fn texts(grid: &[Vec<GridCell>]) -> Vec<Vec<&str>> {
        grid.iter()
            .map(|row| row.iter().map(|c| c.text.as_str()).collect())
            .collect()
    }

    #[test]
    fn grid_expands_colspan_and_rowspan() {
        let grid = parse_fragment_table(
            r#"<table><tr><th rowspan="2">A</th><th colspan="2">B</th></tr>
               <tr><td>b1</td><td>b2</td></tr>
               <tr><td>x<br>y</td><td colspan="2">z</td></tr></table>"#,
        );
        assert_eq!(
            texts(&grid),
            vec![vec!["A", "B", "B"], vec!["A", "b1", "b2"], vec!["x y", "z", "z"]]
        );
        assert!(grid[1][0].is_header);
        assert!(!grid[1][1].is_header);
    }

    #[test]
    fn grid_skips_style_text_and_nested_rows() {
        let grid = parse_fragment_table(
            r#"<table><tr><td><style>.x{color:red}</style>kept</td>
               <td><table><tr><td>inner</td></tr></table></td></tr></table>"#,
        );
        assert_eq!(grid.len(), 1);
        assert_eq!(grid[0][0].text, "kept");
    }

    #[test]
    fn listing_yields_canonical_columns_and_clean_city_names() {
        let page = parse_listing(LISTING).expect("listing parses");
        assert_eq!(page.table.columns(), LISTING_COLUMNS);
        assert_eq!(page.table.len(), 2);
        assert_eq!(page.table.get(CityId(0), "city").unwrap(), "New York");
        assert_eq!(page.table.get(CityId(0), "land_area").unwrap(), "300.5 sq mi");
        assert_eq!(
            page.table.get(CityId(1), "population_density").unwrap(),
            "8,304/sq mi"
        );
        assert_eq!(
            page.table.get(CityId(1), "location").unwrap(),
            "34.02°N 118.41°W / 34.02; -118.41"
        );
    }

    #[test]
    fn listing_without_table_fails() {
        let err = parse_listing("<html><body><table class=\"wikitable\"></table></body></html>")
            .unwrap_err();
        assert!(matches!(err, ExtractError::TableNotFound(_)));
    }

    #[test]
    fn listing_with_wrong_shape_fails() {
        let html = r#"<table class="wikitable sortable">
            <tr><th>a</th><th>b</th><th>c</th><th>d</th><th>e</th><th>f</th>
                <th>g</th><th>h</th><th>i</th><th>j</th><th>k</th></tr>
            <tr><td>1</td><td>2</td><td>3</td></tr></table>"#;
        match parse_listing(html).unwrap_err() {
            ExtractError::ShapeMismatch { row, expected, found } => {
                assert_eq!((row, expected, found), (1, 11, 3));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn links_resolve_one_per_record_despite_repeats() {
        let page = parse_listing(LISTING).unwrap();
        let base = Url::parse("https://en.wikipedia.org").unwrap();
        let links = resolve_links(&page.anchors, &page.table, &base);

        // "New York" is linked twice (city and state); the first anchor wins.
        assert_eq!(
            links.get(CityId(0)).unwrap().as_str(),
            "https://en.wikipedia.org/wiki/New_York_City"
        );
        assert_eq!(
            links.get(CityId(1)).unwrap().as_str(),
            "https://en.wikipedia.org/wiki/Los_Angeles"
        );
        assert_eq!(links.by_city.len(), page.table.len());
        assert!(links.unresolved.is_empty());
    }

    #[test]
    fn unmatched_cities_are_reported() {
        let page = parse_listing(LISTING).unwrap();
        let base = Url::parse("https://en.wikipedia.org").unwrap();
        let anchors = vec![Anchor {
            text: "Los Angeles".into(),
            href: "/wiki/Los_Angeles".into(),
        }];
        let links = resolve_links(&anchors, &page.table, &base);
        assert_eq!(links.unresolved, vec![CityId(0)]);
        assert!(links.get(CityId(0)).is_none());
    }

    #[test]
    fn infobox_rows_start_after_country() {
        let html = r#"<table class="infobox">
            <tr><th colspan="2">Boise, Idaho</th></tr>
            <tr><td colspan="2"><img src="x.png"></td></tr>
            <tr><th>Country</th><td>United States</td></tr>
            <tr><th>State</th><td>Idaho</td></tr>
            <tr><th colspan="2">Government</th></tr>
            <tr><th>• Mayor</th><td>Lauren McLean (D)</td></tr>
            </table>"#;
        let rows = parse_infobox(html).unwrap();
        assert_eq!(
            rows,
            vec![
                DetailAttribute {
                    label: "State".into(),
                    value: "Idaho".into()
                },
                DetailAttribute {
                    label: "Government".into(),
                    value: "Government".into()
                },
                DetailAttribute {
                    label: "• Mayor".into(),
                    value: "Lauren McLean (D)".into()
                },
            ]
        );
    }

    #[test]
    fn infobox_without_country_row_is_an_error() {
        let html = r#"<table class="infobox"><tr><th>State</th><td>Idaho</td></tr></table>"#;
        assert!(matches!(
            parse_infobox(html).unwrap_err(),
            ExtractError::MissingCountryRow
        ));
        assert!(matches!(
            parse_infobox("<p>no panel</p>").unwrap_err(),
            ExtractError::InfoboxNotFound
        ));
    }

    #[test]
    fn lead_paragraph_is_first_unclassed_and_clean() {
        let html = "<div class=\"mw-parser-output\">\
            <p class=\"mw-empty-elt\"></p>\
            <p><b>Boise</b>\u{a0}(listen) is the capital[1] of Idaho.\n</p>\
            <p>Second paragraph.</p></div>";
        assert_eq!(
            parse_lead_paragraph(html).unwrap(),
            "Boise is the capital of Idaho."
        );
    }

    #[test]
    fn lead_paragraph_requires_content() {
        assert!(matches!(
            parse_lead_paragraph("<p>loose</p>").unwrap_err(),
            ExtractError::ContentNotFound
        ));
        assert!(matches!(
            parse_lead_paragraph("<div class=\"mw-parser-output\"><p class=\"x\">a</p></div>")
                .unwrap_err(),
            ExtractError::LeadParagraphNotFound
        ));
    }
}
