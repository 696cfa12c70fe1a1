//! Inbound Credit Matching
//!
//! A reference token is issued with the bank details at intent creation;
//! the customer quotes it on their transfer and the credit is matched
//! back here. Banks mangle references (case, spaces, punctuation), so a
//! normalized comparison backs up the exact one. Nothing is ever
//! auto-matched on name or amount alone.

/// Token prefix on every issued reference.
const REFERENCE_PREFIX: &str = "W3G8";

/// Deterministic matching reference for an intent: the prefix plus the
/// first eight characters of the intent id. Unique per tenant because
/// intent ids are.
pub fn reference_for_intent(intent_id: &str) -> String {
    let head: String = intent_id.chars().take(8).collect();
    format!("{}-{}", REFERENCE_PREFIX, head.to_ascii_uppercase())
}

/// Uppercase and strip everything that is not a letter or digit. What
/// survives is what banks reliably transmit.
pub fn normalize_reference(reference: &str) -> String {
    reference
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Confidence that `presented` is the issued reference. 100 for exact
/// equality, 80 when they agree after normalization, 0 otherwise.
/// Auto-settlement requires a non-zero score; anything else goes to
/// manual review.
pub fn match_confidence(issued: &str, presented: &str) -> u8 {
    if issued == presented {
        return 100;
    }
    if !issued.is_empty() && normalize_reference(issued) == normalize_reference(presented) {
        return 80;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_is_deterministic() {
        let a = reference_for_intent("01j5abcdef99");
        let b = reference_for_intent("01j5abcdef99");
        assert_eq!(a, b);
        assert_eq!(a, "W3G8-01J5ABCD");
    }

    #[test]
    fn test_normalize_strips_noise() {
        assert_eq!(normalize_reference("w3g8-01 ja bc/d."), "W3G801JABCD");
        assert_eq!(normalize_reference("W3G8-01JABCD"), "W3G801JABCD");
    }

    #[test]
    fn test_exact_match_scores_100() {
        assert_eq!(match_confidence("W3G8-01JABCDE", "W3G8-01JABCDE"), 100);
    }

    #[test]
    fn test_normalized_match_scores_80() {
        assert_eq!(match_confidence("W3G8-01JABCDE", "w3g8 01jabcde"), 80);
    }

    #[test]
    fn test_mismatch_scores_zero() {
        assert_eq!(match_confidence("W3G8-01JABCDE", "W3G8-9XYZ1234"), 0);
        assert_eq!(match_confidence("", ""), 100);
        assert_eq!(match_confidence("", "anything"), 0);
    }
}
