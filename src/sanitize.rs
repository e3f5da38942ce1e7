//! Text clean-up applied before a reply is sent for speech synthesis.
//!
//! Markdown emphasis asterisks and pictographic code points are read aloud
//! literally (or mangled) by most TTS engines, so they are stripped.

/// Code point ranges removed from speech text (inclusive).
const STRIPPED_RANGES: &[(u32, u32)] = &[
    (0x1F600, 0x1F6FF), // emoticons, transport and map symbols
    (0x2600, 0x27BF),   // miscellaneous symbols, dingbats
    (0x2B50, 0x2B50),   // white medium star
    (0x2B55, 0x2B55),   // heavy large circle
];

/// Whether `c` is dropped from speech text.
pub fn is_stripped(c: char) -> bool {
    if c == '*' {
        return true;
    }
    let cp = c as u32;
    STRIPPED_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp))
}

/// Remove asterisks and emoji-range code points.
///
/// Whitespace is left untouched, so `"*Hi* 😀"` becomes `"Hi "`.
pub fn sanitize_for_speech(text: &str) -> String {
    text.chars().filter(|&c| !is_stripped(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("*Hi* \u{1F600}", "Hi ")]
    #[case("plain text", "plain text")]
    #[case("", "")]
    #[case("***", "")]
    #[case("sun \u{2600} and star \u{2B50} and circle \u{2B55}", "sun  and star  and circle ")]
    #[case("check \u{2705} done", "check  done")]
    #[case("rocket \u{1F680}!", "rocket !")]
    #[case("**bold** and *italic*", "bold and italic")]
    fn test_sanitize_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_for_speech(input), expected);
    }

    #[test]
    fn test_range_boundaries_are_inclusive() {
        for cp in [0x1F600u32, 0x1F6FF, 0x2600, 0x27BF, 0x2B50, 0x2B55] {
            let c = char::from_u32(cp).expect("valid scalar");
            assert!(is_stripped(c), "U+{cp:X} should be stripped");
        }
    }

    #[test]
    fn test_neighbours_of_ranges_are_kept() {
        for cp in [0x1F5FFu32, 0x1F700, 0x25FF, 0x27C0, 0x2B4F, 0x2B51, 0x2B54, 0x2B56] {
            let c = char::from_u32(cp).expect("valid scalar");
            assert!(!is_stripped(c), "U+{cp:X} should be kept");
        }
    }

    #[test]
    fn test_emoji_outside_ranges_are_kept() {
        // U+1F916 ROBOT FACE sits outside every stripped range.
        assert_eq!(sanitize_for_speech("hi \u{1F916}"), "hi \u{1F916}");
    }

    #[test]
    fn test_non_ascii_letters_kept() {
        assert_eq!(sanitize_for_speech("café naïve 日本"), "café naïve 日本");
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(s in ".*") {
            let once = sanitize_for_speech(&s);
            prop_assert_eq!(sanitize_for_speech(&once), once.clone());
        }

        #[test]
        fn prop_sanitized_has_no_stripped_chars(s in ".*") {
            prop_assert!(!sanitize_for_speech(&s).chars().any(is_stripped));
        }
    }
}
