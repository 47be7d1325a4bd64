//! Column reconciliation: synonym merge, sparsity pruning, named renaming and drops.

use std::collections::BTreeSet;

use citytab_core::{Cell, Table, TableError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::rules::ReconcileRules;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("surviving columns do not match the target schema (missing: {missing:?}, unexpected: {unexpected:?})")]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("invalid reconcile rules: {0}")]
    InvalidRules(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergedSynonym {
    pub canonical: String,
    pub synonym: String,
    pub copied: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub merged: Vec<MergedSynonym>,
    pub pruned: Vec<String>,
    pub dropped: Vec<String>,
}

/// Reconcile the enriched raw table into the target schema.
///
/// After a successful call every record holds exactly the columns of
/// `rules.final_columns()`, in that order.
pub fn reconcile(
    mut table: Table<String>,
    rules: &ReconcileRules,
) -> Result<(Table<String>, ReconcileReport), ReconcileError> {
    let mut report = ReconcileReport::default();

    for rule in &rules.synonyms {
        if let Some(merged) = merge_synonym(&mut table, &rule.canonical, &rule.synonym)? {
            report.merged.push(merged);
        }
    }

    report.pruned = prune_sparse_columns(&mut table, rules.sparsity_threshold);
    if !report.pruned.is_empty() {
        info!(
            pruned = report.pruned.len(),
            threshold = rules.sparsity_threshold,
            "pruned sparse columns"
        );
    }

    apply_target_schema(&mut table, rules)?;

    for column in &rules.drop {
        if table.drop_column(column) {
            report.dropped.push(column.clone());
        }
    }

    Ok((table, report))
}

/// Copy every non-empty synonym cell into the canonical cell of the same record.
///
/// The synonym column itself is kept; sparsity pruning decides whether it survives.
/// Returns `None` when the synonym column was never discovered.
pub fn merge_synonym<C: Cell>(
    table: &mut Table<C>,
    canonical: &str,
    synonym: &str,
) -> Result<Option<MergedSynonym>, TableError> {
    if !table.has_column(synonym) {
        return Ok(None);
    }
    table.add_column(canonical);

    let values: Vec<_> = table
        .column_cells(synonym)
        .filter(|(_, cell)| !cell.is_empty())
        .map(|(id, cell)| (id, cell.clone()))
        .collect();
    let copied = values.len();
    for (id, value) in values {
        table.set(id, canonical, value)?;
    }

    debug!(canonical, synonym, copied, "merged synonym column");
    Ok(Some(MergedSynonym {
        canonical: canonical.to_string(),
        synonym: synonym.to_string(),
        copied,
    }))
}

/// Drop every column with fewer than `threshold` non-empty cells; returns the dropped names.
pub fn prune_sparse_columns<C: Cell>(table: &mut Table<C>, threshold: usize) -> Vec<String> {
    let sparse: Vec<String> = table
        .columns()
        .iter()
        .filter(|column| table.non_empty_count(column) < threshold)
        .cloned()
        .collect();
    for column in &sparse {
        table.drop_column(column);
    }
    sparse
}

fn apply_target_schema<C: Cell>(
    table: &mut Table<C>,
    rules: &ReconcileRules,
) -> Result<(), ReconcileError> {
    let present: BTreeSet<&str> = table.columns().iter().map(String::as_str).collect();
    let expected: BTreeSet<&str> = rules
        .target_schema
        .iter()
        .map(|m| m.source.as_str())
        .collect();

    if present != expected {
        return Err(ReconcileError::SchemaMismatch {
            missing: expected.difference(&present).map(|s| s.to_string()).collect(),
            unexpected: present.difference(&expected).map(|s| s.to_string()).collect(),
        });
    }

    let order = rules.target_schema.iter().map(|m| m.source.clone()).collect();
    table.reorder_columns(order)?;
    for mapping in &rules.target_schema {
        table.rename_column(&mapping.source, &mapping.target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use citytab_core::CityId;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table<String> {
        Table::from_rows(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
        .unwrap()
    }

    fn rules(yaml: &str) -> ReconcileRules {
        ReconcileRules::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn synonym_merge_writes_into_the_same_record() {
        let mut t = table(
            &["city", "zip codes", "zip code"],
            &[
                &["Austin", "78701", ""],
                &["Boise", "", "83702"],
                &["Omaha", "", ""],
            ],
        );
        let merged = merge_synonym(&mut t, "zip codes", "zip code").unwrap().unwrap();
        assert_eq!(merged.copied, 1);
        assert!(t.has_column("zip code"));
        assert_eq!(t.get(CityId(0), "zip codes").unwrap(), "78701");
        assert_eq!(t.get(CityId(1), "zip codes").unwrap(), "83702");
        assert_eq!(t.get(CityId(2), "zip codes").unwrap(), "");
    }

    #[test]
    fn synonym_merge_creates_the_canonical_column() {
        let mut t = table(&["city", "counties"], &[&["Houston", "Harris, Fort Bend"]]);
        merge_synonym(&mut t, "county", "counties").unwrap();
        assert_eq!(t.columns(), ["city", "counties", "county"]);
        assert_eq!(t.get(CityId(0), "county").unwrap(), "Harris, Fort Bend");
        assert_eq!(merge_synonym(&mut t, "demonyms", "demonym").unwrap(), None);
    }

    #[test]
    fn dense_synonym_column_survives_pruning() {
        let mut t = table(
            &["city", "zip codes", "zip code"],
            &[
                &["Austin", "", "78701"],
                &["Boise", "", "83702"],
                &["Omaha", "", ""],
            ],
        );
        merge_synonym(&mut t, "zip codes", "zip code").unwrap();
        let pruned = prune_sparse_columns(&mut t, 2);
        assert!(pruned.is_empty(), "{pruned:?}");
        assert_eq!(t.columns(), ["city", "zip codes", "zip code"]);
        assert_eq!(t.get(CityId(1), "zip codes").unwrap(), "83702");
    }

    #[test]
    fn pruning_keeps_only_columns_at_or_above_threshold() {
        let mut t = table(
            &["city", "mayor", "motto"],
            &[
                &["A", "x", ""],
                &["B", "y", "m"],
                &["C", "", ""],
            ],
        );
        let pruned = prune_sparse_columns(&mut t, 2);
        assert_eq!(pruned, vec!["motto".to_string()]);
        for column in t.columns() {
            assert!(t.non_empty_count(column) >= 2, "{column} survived");
        }
    }

    #[test]
    fn reconciled_records_share_the_target_column_order() {
        let rules = rules(
            r#"
version: 1
sparsity_threshold: 2
synonyms:
  - { canonical: zip codes, synonym: zip code }
target_schema:
  - { source: city, target: city }
  - { source: zip codes, target: zip_codes }
  - { source: type, target: government_type }
  - { source: total, target: total }
drop: [total]
"#,
        );
        let t = table(
            &["city", "total", "type", "zip codes", "zip code", "motto"],
            &[
                &["Austin", "1", "Council", "78701", "", ""],
                &["Boise", "2", "Mayor", "", "83702", ""],
            ],
        );
        let (t, report) = reconcile(t, &rules).unwrap();
        assert_eq!(t.columns(), ["city", "zip_codes", "government_type"]);
        assert_eq!(report.pruned, vec!["zip code".to_string(), "motto".to_string()]);
        assert_eq!(report.dropped, vec!["total".to_string()]);
        for record in t.records() {
            let mut names: Vec<_> = record.column_names().collect();
            names.sort();
            assert_eq!(names, ["city", "government_type", "zip_codes"]);
        }
        assert_eq!(t.get(CityId(1), "government_type").unwrap(), "Mayor");
        assert_eq!(rules.final_columns(), t.columns());
    }

    #[test]
    fn unexpected_surviving_column_is_a_schema_mismatch() {
        let rules = rules(
            r#"
version: 1
sparsity_threshold: 1
target_schema:
  - { source: city, target: city }
  - { source: mayor, target: mayor }
"#,
        );
        let t = table(&["city", "motto"], &[&["Austin", "Keep Austin Weird"]]);
        match reconcile(t, &rules) {
            Err(ReconcileError::SchemaMismatch {
                missing,
                unexpected,
            }) => {
                assert_eq!(missing, vec!["mayor".to_string()]);
                assert_eq!(unexpected, vec!["motto".to_string()]);
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }
}
