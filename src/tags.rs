//! Tag extraction and the inverted tag index.
//!
//! Model identifiers like `qwen/qwen3-30b-a3b:free` are decomposed into a set
//! of lowercase tags ({qwen, qwen3, 30b, a3b, free}) which become the atoms of
//! the routing language. The [`TagIndex`] maps each tag to the set of
//! (channel, model) pairs carrying it and answers AND/NOT queries like
//! `tag:free,qwen3,!vision`.
//!
//! The index is rebuilt by the discovery worker and swapped in atomically as
//! an `Arc` snapshot; the request path only ever reads a snapshot.

use std::collections::{BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Fragments longer than this are junk (base64 blobs, hashes), not tags.
const MAX_TAG_LEN: usize = 50;

/// Parameter-size pattern: `30b`, `8b`, `0.5b`, `135m`.
static PARAM_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.?\d*)[bm]").unwrap());

/// Context-length pattern: `32k`, `128k`, `1m`.
static CONTEXT_LEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.?\d*)[km]").unwrap());

/// A (channel, model) pair — the unit the index stores and queries return.
///
/// Ordered lexicographically by `(channel_id, model_id)` so query results have
/// a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelRef {
    pub channel_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(channel_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self { channel_id: channel_id.into(), model_id: model_id.into() }
    }
}

/// Extract the tag set for a model identifier.
///
/// Lowercases, splits on the separator class `[:/@\-_,]`, drops empty and
/// over-long fragments, then scans for parameter-size (`30b`) and
/// context-length (`128k`) tokens and the `vision` / `code` / `chat` keyword
/// markers. The result is deduplicated and stable.
pub fn extract(model_id: &str) -> BTreeSet<String> {
    let lower = model_id.to_lowercase();
    let mut tags: BTreeSet<String> = BTreeSet::new();

    for fragment in lower.split([':', '/', '@', '-', '_', ',']) {
        if !fragment.is_empty() && fragment.len() <= MAX_TAG_LEN {
            tags.insert(fragment.to_string());
        }
    }

    scan_numeric_tags(&lower, &mut tags);
    scan_keyword_tags(&lower, &mut tags);

    tags
}

/// Parameter-size and context-length tags.
///
/// The number must start at a token boundary (not glued to a preceding
/// alphanumeric — `a3b` stays opaque) and the unit letter must end one:
/// `30b` in `qwen3-30b` counts, the `4o` in `gpt-4o-mini` does not.
fn scan_numeric_tags(lower: &str, tags: &mut BTreeSet<String>) {
    for m in PARAM_SIZE.captures_iter(lower) {
        let Some(whole) = m.get(0) else { continue };
        if !starts_at_boundary(lower, whole.start()) {
            continue;
        }
        // The unit letter must not run into more letters (`30b` yes, `30bit` no).
        if next_char(lower, whole.end()).is_some_and(|c| c.is_ascii_lowercase()) {
            continue;
        }
        if let Some(num) = m.get(1) {
            tags.insert(format!("{}b", num.as_str()));
        }
    }

    for m in CONTEXT_LEN.captures_iter(lower) {
        let Some(whole) = m.get(0) else { continue };
        if !starts_at_boundary(lower, whole.start()) {
            continue;
        }
        let rest = &lower[whole.end()..];
        let follows_context_word = ["tokens", "token", "tok", "ctx", "context"]
            .iter()
            .any(|w| rest.starts_with(w));
        let at_word_boundary = rest
            .chars()
            .next()
            .map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_');
        if follows_context_word || at_word_boundary {
            if let Some(num) = m.get(1) {
                tags.insert(format!("{}k", num.as_str()));
            }
        }
    }
}

fn scan_keyword_tags(lower: &str, tags: &mut BTreeSet<String>) {
    if lower.contains("vision") || lower.contains("visual") {
        tags.insert("vision".to_string());
    }
    if lower.contains("code") || lower.contains("coding") {
        tags.insert("code".to_string());
    }
    if lower.contains("instruct") || lower.contains("chat") {
        tags.insert("chat".to_string());
    }
}

fn starts_at_boundary(s: &str, byte_idx: usize) -> bool {
    s[..byte_idx]
        .chars()
        .next_back()
        .map_or(true, |c| !c.is_ascii_alphanumeric())
}

fn next_char(s: &str, byte_idx: usize) -> Option<char> {
    s[byte_idx..].chars().next()
}

/// Inverted index: tag → posting list of [`ModelRef`]s.
///
/// Immutable once built. The discovery worker constructs a fresh index from
/// the current catalog and swaps it in behind an `Arc`; `add` exists for
/// incremental construction and is idempotent.
#[derive(Debug, Default)]
pub struct TagIndex {
    postings: HashMap<String, BTreeSet<ModelRef>>,
    models: BTreeSet<ModelRef>,
    content_hash: String,
}

/// Aggregate counters exposed through the admin stats endpoint.
#[derive(Debug, serde::Serialize)]
pub struct IndexStats {
    pub total_tags: usize,
    pub total_models: usize,
    pub tag_frequencies: HashMap<String, usize>,
}

impl TagIndex {
    /// Build an index from catalog entries: (channel_id, model_id, channel tags).
    ///
    /// Channel-level tags (`free`, `local`, …) are indexed alongside the tags
    /// derived from the model id, so `tag:free` finds models on free channels
    /// even when the model id itself carries no such marker.
    pub fn build<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a [String])>,
    {
        let mut index = Self::default();
        let mut hasher = Sha256::new();
        for (channel_id, model_id, channel_tags) in entries {
            hasher.update(channel_id.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(model_id.as_bytes());
            hasher.update(b"\x1e");
            index.add(channel_id, model_id, channel_tags);
        }
        index.content_hash = hex::encode(hasher.finalize());
        index
    }

    /// Add one (channel, model) pair. Idempotent: re-adding changes nothing.
    pub fn add(&mut self, channel_id: &str, model_id: &str, channel_tags: &[String]) {
        let model = ModelRef::new(channel_id, model_id);
        let mut tags = extract(model_id);
        for t in channel_tags {
            let t = t.to_lowercase();
            if !t.is_empty() && t.len() <= MAX_TAG_LEN {
                tags.insert(t);
            }
        }
        for tag in tags {
            self.postings.entry(tag).or_default().insert(model.clone());
        }
        self.models.insert(model);
    }

    /// Content hash of the catalog this index was built from.
    ///
    /// A rebuild can be skipped when the hash is unchanged.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// How many models carry `tag`.
    pub fn frequency(&self, tag: &str) -> usize {
        self.postings.get(tag).map_or(0, BTreeSet::len)
    }

    /// Models carrying **all** positive tags and **none** of the negative tags.
    ///
    /// Positive tags are intersected most-selective-first with early
    /// termination on an empty working set. A query with no positive tags
    /// starts from the full model set, so `tag:!vision` means "everything
    /// without vision". Results come back in (channel_id, model_id) order.
    pub fn find(&self, positive: &[String], negative: &[String]) -> Vec<ModelRef> {
        let mut working: BTreeSet<ModelRef> = if positive.is_empty() {
            self.models.clone()
        } else {
            let mut sorted: Vec<&String> = positive.iter().collect();
            sorted.sort_by_key(|t| self.frequency(t));

            let Some((first, rest)) = sorted.split_first() else {
                return Vec::new();
            };
            let Some(seed) = self.postings.get(first.as_str()) else {
                return Vec::new();
            };
            let mut set = seed.clone();
            for tag in rest {
                match self.postings.get(tag.as_str()) {
                    Some(list) => set.retain(|m| list.contains(m)),
                    None => return Vec::new(),
                }
                if set.is_empty() {
                    return Vec::new();
                }
            }
            set
        };

        let mut excluded: HashSet<&ModelRef> = HashSet::new();
        for tag in negative {
            if let Some(list) = self.postings.get(tag.as_str()) {
                excluded.extend(list.iter());
            }
        }
        if !excluded.is_empty() {
            working.retain(|m| !excluded.contains(m));
        }

        working.into_iter().collect()
    }

    /// All tags carried by a specific (channel, model) pair.
    pub fn tags_of(&self, channel_id: &str, model_id: &str) -> Vec<String> {
        let model = ModelRef::new(channel_id, model_id);
        let mut tags: Vec<String> = self
            .postings
            .iter()
            .filter(|(_, list)| list.contains(&model))
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            total_tags: self.postings.len(),
            total_models: self.models.len(),
            tag_frequencies: self
                .postings
                .iter()
                .map(|(tag, list)| (tag.clone(), list.len()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // extract
    // -----------------------------------------------------------------------

    #[test]
    fn extract_worked_example() {
        let tags = extract("qwen/qwen3-30b-a3b:free");
        assert_eq!(tags, tag_set(&["qwen", "qwen3", "30b", "a3b", "free"]));
    }

    #[test]
    fn extract_lowercases_and_dedupes() {
        let tags = extract("Qwen/QWEN-7B");
        assert!(tags.contains("qwen"));
        assert!(tags.contains("7b"));
        assert_eq!(tags.iter().filter(|t| *t == "qwen").count(), 1);
    }

    #[test]
    fn extract_emits_context_length_tag() {
        let tags = extract("yi-34b-200k");
        assert!(tags.contains("200k"), "got {tags:?}");
        assert!(tags.contains("34b"));
    }

    #[test]
    fn extract_number_glued_to_letter_is_not_a_param_tag() {
        // The `3b` inside `a3b` must not become a parameter-size tag.
        let tags = extract("a3b");
        assert!(!tags.contains("3b"), "got {tags:?}");
        assert!(tags.contains("a3b"));
    }

    #[test]
    fn extract_unit_running_into_letters_is_skipped() {
        let tags = extract("gpt-4o-mini");
        assert!(!tags.contains("4b"));
        assert!(!tags.contains("4k"));
    }

    #[test]
    fn extract_fractional_parameter_size() {
        let tags = extract("qwen2.5-0.5b-instruct");
        assert!(tags.contains("0.5b"), "got {tags:?}");
    }

    #[test]
    fn extract_keyword_tags() {
        assert!(extract("llava-vision-7b").contains("vision"));
        assert!(extract("deepseek-coder").contains("code"));
        assert!(extract("mistral-7b-instruct").contains("chat"));
        assert!(extract("gpt-4-visual-preview").contains("vision"));
    }

    #[test]
    fn extract_drops_empty_and_overlong_fragments() {
        let long = "x".repeat(60);
        let tags = extract(&format!("a//{long}:b"));
        assert!(tags.contains("a"));
        assert!(tags.contains("b"));
        assert!(!tags.iter().any(|t| t.len() > MAX_TAG_LEN));
    }

    #[test]
    fn extract_is_stable_under_reextraction() {
        // Canonicalization property: re-extracting the joined tag set loses nothing.
        let first = extract("qwen/qwen3-30b-a3b:free");
        let joined = first.iter().cloned().collect::<Vec<_>>().join("-");
        let second = extract(&joined);
        for tag in &first {
            assert!(second.contains(tag), "lost {tag} in {second:?}");
        }
    }

    // -----------------------------------------------------------------------
    // TagIndex
    // -----------------------------------------------------------------------

    fn sample_index() -> TagIndex {
        let free = vec!["free".to_string()];
        let local = vec!["local".to_string()];
        let none: Vec<String> = vec![];
        let mut index = TagIndex::default();
        index.add("ch-a", "qwen3-8b", &free);
        index.add("ch-b", "qwen3-8b", &none);
        index.add("ch-c", "llava-vision-7b", &local);
        index.add("ch-c", "deepseek-coder-33b", &local);
        index
    }

    #[test]
    fn find_intersects_positive_tags() {
        let index = sample_index();
        let hits = index.find(&["free".into(), "qwen3".into()], &[]);
        assert_eq!(hits, vec![ModelRef::new("ch-a", "qwen3-8b")]);
    }

    #[test]
    fn find_subtracts_negative_tags() {
        let index = sample_index();
        let hits = index.find(&["local".into()], &["vision".into()]);
        assert_eq!(hits, vec![ModelRef::new("ch-c", "deepseek-coder-33b")]);
    }

    #[test]
    fn find_is_order_independent() {
        let index = sample_index();
        let a = index.find(&["free".into(), "qwen3".into()], &["vision".into()]);
        let b = index.find(&["qwen3".into(), "free".into()], &["vision".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn find_with_only_negatives_matches_everything_else() {
        let index = sample_index();
        let hits = index.find(&[], &["vision".into()]);
        assert_eq!(hits.len(), 3);
        assert!(!hits.iter().any(|m| m.model_id.contains("llava")));
    }

    #[test]
    fn find_unknown_positive_tag_returns_empty() {
        let index = sample_index();
        assert!(index.find(&["nonexistent".into()], &[]).is_empty());
    }

    #[test]
    fn find_results_are_sorted_by_channel_then_model() {
        let index = sample_index();
        let hits = index.find(&["qwen3".into()], &[]);
        assert_eq!(
            hits,
            vec![ModelRef::new("ch-a", "qwen3-8b"), ModelRef::new("ch-b", "qwen3-8b")]
        );
    }

    #[test]
    fn add_is_idempotent() {
        let mut index = sample_index();
        let before = index.stats().total_models;
        index.add("ch-a", "qwen3-8b", &["free".to_string()]);
        assert_eq!(index.stats().total_models, before);
    }

    #[test]
    fn build_hash_is_stable_and_order_sensitive_content_insensitive() {
        let tags: Vec<String> = vec![];
        let a = TagIndex::build(vec![("c1", "m1", tags.as_slice()), ("c2", "m2", tags.as_slice())]);
        let b = TagIndex::build(vec![("c1", "m1", tags.as_slice()), ("c2", "m2", tags.as_slice())]);
        assert_eq!(a.content_hash(), b.content_hash());

        let c = TagIndex::build(vec![("c1", "m1", tags.as_slice())]);
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn stats_counts_tags_and_models() {
        let index = sample_index();
        let stats = index.stats();
        assert_eq!(stats.total_models, 4);
        assert_eq!(stats.tag_frequencies["local"], 2);
        assert_eq!(stats.tag_frequencies["free"], 1);
    }

    #[test]
    fn tags_of_returns_all_tags_for_pair() {
        let index = sample_index();
        let tags = index.tags_of("ch-a", "qwen3-8b");
        assert!(tags.contains(&"free".to_string()));
        assert!(tags.contains(&"qwen3".to_string()));
        assert!(tags.contains(&"8b".to_string()));
    }
}
