//! Text preparation for synthesis and recognition.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use tracing::warn;

fn static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| static_regex(r"<[^>]+>"));
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"```[A-Za-z0-9_-]*"));
static MD_IMAGE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"!\[([^\]]*)\]\([^)]*\)"));
static MD_LINK: LazyLock<Regex> = LazyLock::new(|| static_regex(r"\[([^\]]+)\]\([^)]*\)"));
static MD_HEADER: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+"));
static MD_QUOTE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?m)^[ \t]*>[ \t]?"));
static MD_BULLET: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?m)^[ \t]*[-*+][ \t]+"));
static MD_EMPHASIS: LazyLock<Regex> = LazyLock::new(|| static_regex(r"\*{1,3}|_{2,3}|~~|`"));
static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(
        r"[\x{1F000}-\x{1FAFF}\x{2600}-\x{27BF}\x{2B00}-\x{2BFF}\x{FE0F}\x{200D}\x{20E3}]",
    )
});
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"\s+"));

const ENTITIES: [(&str, &str); 6] = [
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&amp;", "&"),
];

/// Strip markup, markdown emphasis, and emoji so only speakable text remains.
pub fn normalize_for_speech(text: &str) -> String {
    let mut out = HTML_TAG.replace_all(text, " ").into_owned();
    for (entity, plain) in ENTITIES {
        out = out.replace(entity, plain);
    }
    out = CODE_FENCE.replace_all(&out, " ").into_owned();
    out = MD_IMAGE.replace_all(&out, "").into_owned();
    out = MD_LINK.replace_all(&out, "$1").into_owned();
    out = MD_HEADER.replace_all(&out, "").into_owned();
    out = MD_QUOTE.replace_all(&out, "").into_owned();
    out = MD_BULLET.replace_all(&out, "").into_owned();
    out = MD_EMPHASIS.replace_all(&out, "").into_owned();
    out = EMOJI.replace_all(&out, "").into_owned();
    WHITESPACE.replace_all(&out, " ").trim().to_string()
}

/// Rewrite lexicon terms (whole words, case-insensitive) to their phonetic hints.
///
/// Longer terms are applied first so a term never clobbers a longer one
/// containing it.
pub fn apply_lexicon(text: &str, lexicon: &HashMap<String, String>) -> String {
    if lexicon.is_empty() {
        return text.to_string();
    }

    let mut terms: Vec<(&String, &String)> = lexicon.iter().collect();
    terms.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut out = text.to_string();
    for (term, replacement) in terms {
        if term.trim().is_empty() {
            continue;
        }
        let pattern = format!(r"(?i)\b{}\b", regex::escape(term));
        match Regex::new(&pattern) {
            Ok(re) => out = re.replace_all(&out, NoExpand(replacement)).into_owned(),
            Err(e) => warn!(term = %term, error = %e, "Skipping lexicon term"),
        }
    }
    out
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// SSML document requesting viseme output for `text` in `voice`.
pub fn build_ssml(text: &str, voice: &str, language: &str) -> String {
    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" \
         xmlns:mstts=\"https://www.w3.org/2001/mstts\" xml:lang=\"{lang}\">\
         <voice name=\"{voice}\"><mstts:viseme type=\"redlips_front\"/>{body}</voice></speak>",
        lang = xml_escape(language),
        voice = xml_escape(voice),
        body = xml_escape(text),
    )
}

/// Collapse a stuttered repeat: when the transcript's second half matches its
/// first half, keep only the first half.
pub fn dedupe_stutter(text: &str) -> String {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() < 2 {
        return trimmed.to_string();
    }

    let mid = chars.len() / 2;
    let first: String = chars[..mid].iter().collect();
    let second: String = chars[mid..].iter().collect();
    let (first, second) = (first.trim(), second.trim());

    if !first.is_empty() && first.to_lowercase() == second.to_lowercase() {
        first.to_string()
    } else {
        trimmed.to_string()
    }
}
