//! Conversation title derivation.
//!
//! Titles are short slugs of the first operator message. Derivation is
//! deterministic so the title is available the moment the first turn
//! finishes, with no model round trip.

/// Maximum title length in characters.
const MAX_TITLE_CHARS: usize = 48;

const FALLBACK_TITLE: &str = "New conversation";

/// Derives a short title from the first user message.
pub fn derive_title(message: &str) -> String {
    let Some(line) = message.lines().find(|l| !l.trim().is_empty()) else {
        return FALLBACK_TITLE.to_string();
    };
    let mut line = line.trim().to_string();

    for prefix in ["title:", "Title:"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest.trim().to_string();
            break;
        }
    }

    let trimmed = line
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    if trimmed.is_empty() {
        return FALLBACK_TITLE.to_string();
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_at_word(&collapsed, MAX_TITLE_CHARS)
}

/// Cuts at a word boundary, never mid-word, and drops trailing
/// punctuation left by the cut.
fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut result = String::new();
    for word in text.split(' ') {
        let candidate_len = if result.is_empty() {
            word.chars().count()
        } else {
            result.chars().count() + 1 + word.chars().count()
        };
        if candidate_len > max_chars {
            break;
        }
        if !result.is_empty() {
            result.push(' ');
        }
        result.push_str(word);
    }

    if result.is_empty() {
        // Single oversized word: hard cut.
        result = text.chars().take(max_chars).collect();
    }
    result
        .trim_end_matches([',', ';', ':', '.', '-'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_is_kept() {
        assert_eq!(derive_title("hello"), "hello");
    }

    #[test]
    fn test_first_nonempty_line_wins() {
        assert_eq!(derive_title("\n\nfix the login bug\nmore detail"), "fix the login bug");
    }

    #[test]
    fn test_prefix_and_quotes_are_stripped() {
        assert_eq!(derive_title("Title: \"Refactor the parser\""), "Refactor the parser");
    }

    #[test]
    fn test_whitespace_collapses() {
        assert_eq!(derive_title("fix   the\tspacing"), "fix the spacing");
    }

    #[test]
    fn test_long_message_cuts_at_word_boundary() {
        let title = derive_title(
            "please investigate why the deployment pipeline fails on the second stage of the build",
        );
        assert!(title.chars().count() <= MAX_TITLE_CHARS);
        assert!(!title.ends_with(' '));
        assert!(title.starts_with("please investigate"));
    }

    #[test]
    fn test_oversized_single_word_is_hard_cut() {
        let word = "x".repeat(100);
        let title = derive_title(&word);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_empty_message_falls_back() {
        assert_eq!(derive_title("   \n  "), FALLBACK_TITLE);
        assert_eq!(derive_title("\"\""), FALLBACK_TITLE);
    }
}
