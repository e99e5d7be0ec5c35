//! TTS input sanitization. Must be idempotent:
//! `sanitize(sanitize(x)) == sanitize(x)`.

use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    code_fence: Regex,
    inline_code: Regex,
    markdown_heading: Regex,
    markdown_emphasis: Regex,
    repeated_punct: Regex,
    whitespace: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        code_fence: Regex::new(r"```[\s\S]*?```").unwrap(),
        inline_code: Regex::new(r"`([^`]*)`").unwrap(),
        markdown_heading: Regex::new(r"(?m)^#{1,6}\s*").unwrap(),
        // bold/italic emphasis markers (**x**, __x__, *x*, _x_) carry no
        // spoken content of their own; keep the wrapped text.
        markdown_emphasis: Regex::new(r"(\*{1,2}|_{1,2})([^*_\n]+)\1").unwrap(),
        repeated_punct: Regex::new(r"([!?.,;:])\1{2,}").unwrap(),
        whitespace: Regex::new(r"[ \t]{2,}").unwrap(),
    })
}

/// Symbolic token -> spoken equivalent (or empty string) table. Ordered so
/// multi-character tokens are replaced before any character-level pass.
const SYMBOL_TABLE: &[(&str, &str)] = &[
    ("=>", " goes to "),
    ("->", " rightarrow "),
    ("<-", " leftarrow "),
    ("&&", " and "),
    ("||", " or "),
    ("§", " section "),
    ("→", " rightarrow "),
    ("←", " leftarrow "),
    ("★", ""),
    ("☆", ""),
    ("✅", ""),
    ("❌", ""),
    ("🚀", ""),
    ("📋", ""),
    ("📝", ""),
    ("⚡", ""),
    ("📊", ""),
    ("📥", ""),
    ("📤", ""),
];

/// Strips markup and non-spoken symbols before TTS. Safe to apply more
/// than once: a second pass is a no-op.
pub fn sanitize(input: &str) -> String {
    let p = patterns();

    // code blocks and fences carry no spoken content
    let mut text = p.code_fence.replace_all(input, "").to_string();
    text = p.inline_code.replace_all(&text, "$1").to_string();
    text = p.markdown_heading.replace_all(&text, "").to_string();
    text = p.markdown_emphasis.replace_all(&text, "$2").to_string();

    for (symbol, spoken) in SYMBOL_TABLE {
        if text.contains(symbol) {
            text = text.replace(symbol, spoken);
        }
    }

    // strip remaining emoji / non-ASCII symbol codepoints the table missed,
    // keeping common punctuation and accented letters
    text = text
        .chars()
        .filter(|c| {
            c.is_ascii()
                || c.is_alphabetic()
                || c.is_whitespace()
        })
        .collect();

    text = p.repeated_punct.replace_all(&text, "$1$1").to_string();
    text = p.whitespace.replace_all(&text, " ").to_string();
    text = text.trim().to_string();
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_idempotent() {
        let samples = [
            "Hello **world**! 🚀 Check out `code` and ```block```",
            "rightarrow already spoken, no symbols here.",
            "### Heading\nSome text -> more text!!!!! and... dots....",
            "",
            "plain ascii text with no symbols",
        ];
        for sample in samples {
            let once = sanitize(sample);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn collapses_repeated_punctuation_and_whitespace() {
        let out = sanitize("Wait.....   really??");
        assert!(!out.contains("....."));
        assert!(!out.contains("   "));
    }

    #[test]
    fn strips_code_fences_and_backticks() {
        let out = sanitize("Run `cargo test` inside ```fn main() {}```");
        assert!(!out.contains('`'));
    }

    #[test]
    fn replaces_arrow_tokens_with_spoken_equivalents() {
        let out = sanitize("a -> b");
        assert!(out.contains("rightarrow"));
    }

    #[test]
    fn strips_markdown_emphasis_markers_but_keeps_text() {
        let out = sanitize("Hello **world**, this is _important_.");
        assert!(!out.contains('*'));
        assert!(!out.contains('_'));
        assert!(out.contains("world"));
        assert!(out.contains("important"));
    }
}
