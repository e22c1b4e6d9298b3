//! Text processing utilities shared by resolution and context assembly

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    static ref PUNCT_REGEX: Regex = Regex::new(r"[^\w\s]").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Canonical form used for name equality: lowercased, punctuation
    /// stripped, whitespace collapsed.
    pub fn normalize_name(text: &str) -> String {
        let lowered = text.to_lowercase();
        let stripped = PUNCT_REGEX.replace_all(&lowered, "");
        WHITESPACE_REGEX.replace_all(stripped.trim(), " ").into_owned()
    }

    /// Normalize whitespace without allocation when already clean
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Levenshtein distance over chars, single-row DP
    pub fn edit_distance(a: &str, b: &str) -> usize {
        let a_chars: Vec<char> = a.chars().collect();
        let b_chars: Vec<char> = b.chars().collect();

        if a_chars.is_empty() {
            return b_chars.len();
        }
        if b_chars.is_empty() {
            return a_chars.len();
        }

        let mut row: Vec<usize> = (0..=b_chars.len()).collect();

        for (i, ca) in a_chars.iter().enumerate() {
            let mut prev_diag = row[0];
            row[0] = i + 1;

            for (j, cb) in b_chars.iter().enumerate() {
                let cost = if ca == cb { 0 } else { 1 };
                let candidate = (prev_diag + cost).min(row[j] + 1).min(row[j + 1] + 1);
                prev_diag = row[j + 1];
                row[j + 1] = candidate;
            }
        }

        row[b_chars.len()]
    }

    /// Edit-distance similarity in [0, 1], normalized by the longer string
    pub fn edit_similarity(a: &str, b: &str) -> f32 {
        let max_len = a.chars().count().max(b.chars().count());
        if max_len == 0 {
            return 1.0;
        }
        1.0 - (Self::edit_distance(a, b) as f32 / max_len as f32)
    }

    /// Rough token estimate (~4 chars per token)
    pub fn estimate_tokens(text: &str) -> usize {
        text.len() / 4
    }

    /// Truncate to a token budget at a whitespace boundary where possible
    pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> Cow<'_, str> {
        let max_chars = max_tokens.saturating_mul(4);
        if text.len() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars == 0 {
            return Cow::Borrowed("");
        }

        let mut cut = max_chars.min(text.len());
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let head = &text[..cut];
        match head.rfind(char::is_whitespace) {
            Some(pos) if pos > max_chars / 2 => Cow::Owned(head[..pos].trim_end().to_string()),
            _ => Cow::Owned(head.to_string()),
        }
    }

    /// Check if word is significant (not a stop word, long enough)
    pub fn is_significant_word(word: &str, min_len: usize) -> bool {
        if word.len() < min_len {
            return false;
        }

        !matches!(word.to_lowercase().as_str(), "the" | "a" | "an" | "and" | "or" | "but" | "in" | "on" | "at" | "to" | "for" |
            "of" | "with" | "by" | "is" | "am" | "are" | "was" | "were" | "be" | "been" |
            "being" | "have" | "has" | "had" | "do" | "does" | "did" | "my" | "his" | "her" |
            "their" | "our" | "this" | "that" | "these" | "those" | "it" | "its")
    }

    /// First sentence of a text block, capped at `max_chars`
    pub fn first_sentence(text: &str, max_chars: usize) -> &str {
        let trimmed = text.trim();
        let end = trimmed
            .char_indices()
            .find(|(_, c)| matches!(c, '.' | '!' | '?'))
            .map(|(i, _)| i + 1)
            .unwrap_or(trimmed.len());
        let mut cut = end.min(max_chars).min(trimmed.len());
        while cut > 0 && !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        &trimmed[..cut]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ===== Normalization Tests =====

    #[test]
    fn test_normalize_name_case_and_punctuation() {
        assert_eq!(TextUtils::normalize_name("Acme, Corp."), "acme corp");
        assert_eq!(TextUtils::normalize_name("  John   Smith "), "john smith");
        assert_eq!(TextUtils::normalize_name("O'Brien"), "obrien");
    }

    #[test]
    fn test_normalize_name_idempotent() {
        let once = TextUtils::normalize_name("Dr. Jane K. Doe!");
        let twice = TextUtils::normalize_name(&once);
        assert_eq!(once, twice);
    }

    // ===== Edit Distance Tests =====

    #[test]
    fn test_edit_distance_basics() {
        assert_eq!(TextUtils::edit_distance("kitten", "sitting"), 3);
        assert_eq!(TextUtils::edit_distance("", "abc"), 3);
        assert_eq!(TextUtils::edit_distance("same", "same"), 0);
    }

    #[test]
    fn test_edit_similarity_range() {
        assert_eq!(TextUtils::edit_similarity("", ""), 1.0);
        assert!(TextUtils::edit_similarity("john smith", "jane smith") < 0.85);
        assert!(TextUtils::edit_similarity("elizabeth", "elisabeth") > 0.85);
    }

    // ===== Token Estimation Tests =====

    #[test]
    fn test_truncate_to_tokens_respects_budget() {
        let text = "word ".repeat(100);
        let truncated = TextUtils::truncate_to_tokens(&text, 10);
        assert!(TextUtils::estimate_tokens(&truncated) <= 10);
    }

    #[test]
    fn test_truncate_short_text_borrowed() {
        let text = "short";
        assert!(matches!(TextUtils::truncate_to_tokens(text, 100), Cow::Borrowed(_)));
    }

    proptest! {
        #[test]
        fn prop_truncate_never_exceeds_budget(text in ".{0,400}", budget in 0usize..64) {
            let out = TextUtils::truncate_to_tokens(&text, budget);
            prop_assert!(out.len() <= budget * 4);
        }

        #[test]
        fn prop_edit_similarity_bounded(a in "[a-z]{0,24}", b in "[a-z]{0,24}") {
            let sim = TextUtils::edit_similarity(&a, &b);
            prop_assert!((0.0..=1.0).contains(&sim));
        }
    }

    // ===== Sentence Tests =====

    #[test]
    fn test_first_sentence() {
        assert_eq!(TextUtils::first_sentence("Hello there. More text.", 64), "Hello there.");
        assert_eq!(TextUtils::first_sentence("no terminator", 64), "no terminator");
    }
}
