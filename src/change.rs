// src/change.rs
//
// =============================================================================
// RAGKEEPER: CHANGE DETECTOR
// =============================================================================
//
// Pure partitioning logic, no I/O. Diffs a freshly loaded document set
// against the ledger into four disjoint sets.

use crate::document::Document;
use crate::ledger::LedgerRow;
use log::warn;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSets {
    pub new: Vec<Document>,
    pub modified: Vec<Document>,
    pub unchanged: Vec<Document>,
    pub deleted_sources: Vec<String>,
}

impl ChangeSets {
    pub fn total_changed(&self) -> usize {
        self.new.len() + self.modified.len() + self.deleted_sources.len()
    }
}

/// Diffs `loaded` against `ledger`. When the same source appears twice in
/// `loaded`, the last occurrence wins and a warning is logged.
pub fn detect_changes(loaded: &[Document], ledger: &HashMap<String, LedgerRow>) -> ChangeSets {
    let mut by_source: HashMap<&str, &Document> = HashMap::new();
    for doc in loaded {
        if by_source.insert(doc.source.as_str(), doc).is_some() {
            warn!("duplicate source in load, last occurrence wins: {}", doc.source);
        }
    }

    let mut sets = ChangeSets::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for (source, doc) in &by_source {
        seen.insert(source);
        match ledger.get(*source) {
            None => sets.new.push((*doc).clone()),
            Some(row) => {
                if row.content_checksum != doc.content_checksum {
                    sets.modified.push((*doc).clone());
                } else {
                    sets.unchanged.push((*doc).clone());
                }
            }
        }
    }

    for source in ledger.keys() {
        if !seen.contains(source.as_str()) {
            sets.deleted_sources.push(source.clone());
        }
    }

    sets.new.sort_by(|a, b| a.source.cmp(&b.source));
    sets.modified.sort_by(|a, b| a.source.cmp(&b.source));
    sets.unchanged.sort_by(|a, b| a.source.cmp(&b.source));
    sets.deleted_sources.sort();

    sets
}

/// The fraction of ledger entries touched by this load, used to decide
/// between an incremental update and a full rebuild.
pub fn change_ratio(sets: &ChangeSets, ledger_len: usize) -> f64 {
    sets.total_changed() as f64 / ledger_len.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn doc(source: &str, checksum: &str) -> Document {
        Document {
            content: "body".into(),
            source: source.to_string(),
            title: "T".into(),
            date: None,
            categories: vec![],
            description: None,
            cover_image: None,
            cover_video: None,
            reading_time: None,
            published: true,
            url: format!("https://example.com/{source}"),
            post_slug: source.to_string(),
            content_length: 4,
            content_checksum: checksum.to_string(),
            last_modified: 0,
        }
    }

    fn row(source: &str, checksum: &str) -> LedgerRow {
        LedgerRow {
            source: source.to_string(),
            content_checksum: checksum.to_string(),
            last_modified: 0,
            indexed_timestamp: 0,
            indexed: true,
        }
    }

    #[test]
    fn partitions_into_four_disjoint_sets() {
        let mut ledger = HashMap::new();
        ledger.insert("a.md".to_string(), row("a.md", "old"));
        ledger.insert("b.md".to_string(), row("b.md", "same"));
        ledger.insert("c.md".to_string(), row("c.md", "gone"));

        let loaded = vec![doc("a.md", "new"), doc("b.md", "same"), doc("d.md", "fresh")];
        let sets = detect_changes(&loaded, &ledger);

        assert_eq!(sets.new.iter().map(|d| &d.source).collect::<Vec<_>>(), vec!["d.md"]);
        assert_eq!(sets.modified.iter().map(|d| &d.source).collect::<Vec<_>>(), vec!["a.md"]);
        assert_eq!(sets.unchanged.iter().map(|d| &d.source).collect::<Vec<_>>(), vec!["b.md"]);
        assert_eq!(sets.deleted_sources, vec!["c.md".to_string()]);
    }

    #[test]
    fn empty_corpus_and_empty_ledger_yields_empty_sets() {
        let sets = detect_changes(&[], &HashMap::new());
        assert_eq!(sets, ChangeSets::default());
    }

    #[test]
    fn duplicate_source_last_occurrence_wins() {
        let loaded = vec![doc("a.md", "first"), doc("a.md", "second")];
        let sets = detect_changes(&loaded, &HashMap::new());
        assert_eq!(sets.new.len(), 1);
        assert_eq!(sets.new[0].content_checksum, "second");
    }

    #[test]
    fn change_ratio_uses_ledger_len_with_floor_one() {
        let sets = ChangeSets {
            new: vec![doc("a", "1")],
            ..Default::default()
        };
        assert_eq!(change_ratio(&sets, 0), 1.0);
        assert_eq!(change_ratio(&sets, 2), 0.5);
    }
}
