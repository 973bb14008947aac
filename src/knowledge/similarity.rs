// src/knowledge/similarity.rs
// Signature similarity: token-set overlap with an edit-distance fallback.
//
// Two measures are taken and the higher wins: Jaccard overlap of the token
// sets (robust for reordered wording) and normalized Levenshtein distance
// (robust for short signatures where single-token sets make Jaccard too
// coarse).

use std::collections::HashSet;

/// Levenshtein comparison is capped; longer signatures are truncated first
/// so a pathological input cannot make the DP table explode.
const LEVENSHTEIN_MAX_CHARS: usize = 256;

/// Lowercased alphanumeric tokens of length > 1.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of two token sets.
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Classic DP Levenshtein over chars, inputs pre-truncated.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().take(LEVENSHTEIN_MAX_CHARS).collect();
    let b: Vec<char> = b.chars().take(LEVENSHTEIN_MAX_CHARS).collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Edit similarity in [0, 1]: 1.0 means identical strings.
fn edit_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a, &b);
    1.0 - (distance as f64 / max_len as f64)
}

/// Similarity of two pattern signatures in [0, 1].
pub fn signature_similarity(a: &str, b: &str) -> f64 {
    let token_sim = jaccard(&tokenize(a), &tokenize(b));
    let edit_sim = edit_similarity(a, b);
    token_sim.max(edit_sim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_signatures() {
        assert!((signature_similarity("run tests before commit", "run tests before commit") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reordered_tokens_score_high() {
        let sim = signature_similarity(
            "before commit run the tests",
            "run the tests before commit",
        );
        assert!(sim > 0.9, "reordering should barely matter, got {sim}");
    }

    #[test]
    fn test_near_duplicate_above_default_threshold() {
        let sim = signature_similarity(
            "retry flaky integration tests with backoff",
            "retry flaky integration test with backoff",
        );
        assert!(sim >= 0.85, "near-duplicates should merge, got {sim}");
    }

    #[test]
    fn test_unrelated_signatures_score_low() {
        let sim = signature_similarity(
            "retry flaky integration tests",
            "pin transitive dependency versions",
        );
        assert!(sim < 0.5, "unrelated signatures must not merge, got {sim}");
    }

    #[test]
    fn test_short_signatures_use_edit_distance() {
        // One-token signatures defeat Jaccard; the edit measure catches them.
        let sim = signature_similarity("rollback", "rollbck");
        assert!(sim > 0.85, "typo distance should dominate, got {sim}");
    }

    #[test]
    fn test_empty_signatures() {
        assert!((signature_similarity("", "") - 1.0).abs() < f64::EPSILON);
        assert!(signature_similarity("something", "") < 0.1);
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
    }

    #[test]
    fn test_symmetry() {
        let a = "close idle conversations on timeout";
        let b = "archive idle conversations after timeout";
        assert!((signature_similarity(a, b) - signature_similarity(b, a)).abs() < 1e-12);
    }
}
