//! Tag predicate engine.
//!
//! Tags are opaque strings. A pass selects nodes by requiring a list of tags to be
//! present on the node; nothing else about a tag is interpreted.

use std::collections::BTreeSet;

/// Unordered tag set carried by blocks, refinements and indexes.
pub type Tags = BTreeSet<String>;

/// True iff every required tag is present. An empty requirement matches everything.
pub fn matches(tags: &Tags, required: &[String]) -> bool {
    required.iter().all(|req| tags.contains(req))
}

/// Build a tag set from string slices.
pub fn tag_set<I, S>(tags: I) -> Tags
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

/// Add every tag in `extra` to `tags`.
pub fn add_tags(tags: &mut Tags, extra: &[String]) {
    tags.extend(extra.iter().cloned());
}
