//! Retrieval result aggregation.
//!
//! Turns the flat, relevance-ranked passage list returned by similarity
//! search into one [`SourceGroup`] per source file, each merged into a
//! single context block.
//!
//! # Ordering
//!
//! - Groups appear in order of their best-ranked passage (first
//!   appearance in the result list), so the order is stable for the whole
//!   response.
//! - Within a group, passages are sorted by `chunk_index` when every
//!   passage has one. If any passage lacks an index the whole group keeps
//!   arrival order instead.
//!
//! # Merged text
//!
//! ```text
//! From guide.md:
//!
//! --- (part 1/3) ---
//! <content of chunk 0>
//!
//! --- (part 2/3) ---
//! <content of chunk 1>
//! ```

use crate::models::RetrievedPassage;

/// Group name for passages whose `file_name` is missing or empty.
pub const UNKNOWN_SOURCE: &str = "Unknown source";

/// How the passages of a group were ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    /// Sorted ascending by `chunk_index`.
    ChunkIndex,
    /// At least one passage had no `chunk_index`; arrival order kept.
    Arrival,
}

/// All retrieved passages from one source file.
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub source_name: String,
    pub passages: Vec<RetrievedPassage>,
    pub order: GroupOrder,
}

impl SourceGroup {
    /// Render the group as one context block.
    pub fn merged_text(&self) -> String {
        let mut out = format!("From {}:\n", self.source_name);
        for p in &self.passages {
            if let Some(info) = p.metadata.chunk_info.as_deref().filter(|s| !s.is_empty()) {
                out.push_str(&format!("\n--- {} ---\n", info));
            }
            out.push_str(&p.content);
            out.push('\n');
        }
        out
    }
}

fn source_name(passage: &RetrievedPassage) -> &str {
    match passage.metadata.file_name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => UNKNOWN_SOURCE,
    }
}

/// Group ranked passages by source file.
pub fn group_passages(passages: Vec<RetrievedPassage>) -> Vec<SourceGroup> {
    let mut groups: Vec<SourceGroup> = Vec::new();

    for passage in passages {
        let name = source_name(&passage);
        match groups.iter_mut().find(|g| g.source_name == name) {
            Some(group) => group.passages.push(passage),
            None => groups.push(SourceGroup {
                source_name: name.to_string(),
                passages: vec![passage],
                order: GroupOrder::Arrival,
            }),
        }
    }

    for group in &mut groups {
        if group.passages.iter().all(|p| p.metadata.chunk_index.is_some()) {
            // Stable: duplicate indices keep arrival order.
            group.passages.sort_by_key(|p| p.metadata.chunk_index);
            group.order = GroupOrder::ChunkIndex;
        }
    }

    groups
}

/// Group passages and render each group, returning `(source_name, merged_text)` pairs.
pub fn group(passages: Vec<RetrievedPassage>) -> Vec<(String, String)> {
    group_passages(passages)
        .into_iter()
        .map(|g| {
            let text = g.merged_text();
            (g.source_name, text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn passage(
        file: Option<&str>,
        idx: Option<usize>,
        info: &str,
        content: &str,
    ) -> RetrievedPassage {
        RetrievedPassage {
            content: content.to_string(),
            metadata: ChunkMetadata {
                file_name: file.map(str::to_string),
                content_type: None,
                chunk_index: idx,
                chunk_count: None,
                chunk_info: Some(info.to_string()),
            },
            rank: 0,
            score: None,
        }
    }

    #[test]
    fn test_groups_by_file_and_sorts_by_index() {
        let groups = group_passages(vec![
            passage(Some("a.md"), Some(1), "", "a1"),
            passage(Some("b.md"), Some(0), "", "b0"),
            passage(Some("a.md"), Some(0), "", "a0"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].source_name, "a.md");
        assert_eq!(groups[0].order, GroupOrder::ChunkIndex);
        let a: Vec<&str> = groups[0].passages.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(a, vec!["a0", "a1"]);
        assert_eq!(groups[1].source_name, "b.md");
        assert_eq!(groups[1].passages.len(), 1);
    }

    #[test]
    fn test_missing_file_name_goes_to_unknown_source() {
        let groups = group_passages(vec![
            passage(None, Some(0), "", "x"),
            passage(Some(""), Some(1), "", "y"),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].source_name, UNKNOWN_SOURCE);
        assert_eq!(groups[0].passages.len(), 2);
    }

    #[test]
    fn test_partial_index_falls_back_to_arrival_order() {
        let groups = group_passages(vec![
            passage(Some("a.md"), Some(3), "", "third"),
            passage(Some("a.md"), None, "", "unindexed"),
            passage(Some("a.md"), Some(0), "", "first"),
        ]);
        assert_eq!(groups[0].order, GroupOrder::Arrival);
        let order: Vec<&str> = groups[0].passages.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(order, vec!["third", "unindexed", "first"]);
    }

    #[test]
    fn test_fallback_is_per_group() {
        let groups = group_passages(vec![
            passage(Some("a.md"), Some(2), "", "a2"),
            passage(Some("b.md"), None, "", "b?"),
            passage(Some("a.md"), Some(1), "", "a1"),
        ]);
        assert_eq!(groups[0].order, GroupOrder::ChunkIndex);
        assert_eq!(groups[0].passages[0].content, "a1");
        assert_eq!(groups[1].order, GroupOrder::Arrival);
    }

    #[test]
    fn test_merged_text_with_markers() {
        let groups = group_passages(vec![
            passage(Some("a.md"), Some(1), " (part 2/2)", "second"),
            passage(Some("a.md"), Some(0), " (part 1/2)", "first"),
        ]);
        assert_eq!(
            groups[0].merged_text(),
            "From a.md:\n\n---  (part 1/2) ---\nfirst\n\n---  (part 2/2) ---\nsecond\n"
        );
    }

    #[test]
    fn test_merged_text_without_markers() {
        let groups = group_passages(vec![passage(Some("notes.txt"), Some(0), "", "body")]);
        assert_eq!(groups[0].merged_text(), "From notes.txt:\nbody\n");

        let mut p = passage(Some("raw.txt"), None, "", "no info");
        p.metadata.chunk_info = None;
        assert_eq!(
            group(vec![p]),
            vec![(
                "raw.txt".to_string(),
                "From raw.txt:\nno info\n".to_string()
            )]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(group_passages(Vec::new()).is_empty());
    }
}
