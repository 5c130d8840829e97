//! Title normalization and similarity.

/// Case-fold, replace anything non-alphanumeric with a space, collapse runs
/// of whitespace.
///
/// `"Attention Is All You Need!"` and `"attention-is-all-you-need"` both
/// normalize to `"attention is all you need"`.
pub fn normalize_title(title: &str) -> String {
    let mapped: String = title
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two normalized titles in [0, 1].
pub fn title_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Upper bound on [`title_similarity`] from lengths alone.
///
/// Levenshtein distance is at least the length difference, so titles whose
/// lengths differ too much can be skipped without scoring.
pub(crate) fn similarity_bound(a_len: usize, b_len: usize) -> f64 {
    let longest = a_len.max(b_len);
    if longest == 0 {
        return 1.0;
    }
    1.0 - (a_len.abs_diff(b_len) as f64 / longest as f64)
}
