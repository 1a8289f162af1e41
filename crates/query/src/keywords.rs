use std::collections::BTreeSet;

use extract::EntityNormalizer;

const MAX_NGRAM: usize = 3;

/// Candidate entity names in a query: every run of one to three words, normalized the
/// same way entity names are.
pub fn query_keywords(normalizer: &EntityNormalizer, query: &str) -> Vec<String> {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| normalizer.normalize_name(w))
        .filter(|w| !w.is_empty())
        .collect();

    let mut keywords = BTreeSet::new();
    for n in 1..=MAX_NGRAM.min(words.len()) {
        for window in words.windows(n) {
            keywords.insert(window.join(" "));
        }
    }
    keywords.into_iter().collect()
}
