//! Query language heuristics for cross-language retrieval.
//!
//! The dominant language of a query is guessed from character-class counts:
//! Han ideographs, kana, Hangul, and Latin letters. When it differs from the
//! configured retrieval language the engine searches with several query
//! variants built by [`query_variants`].

use std::collections::HashSet;

/// Maximum number of query variants searched for one query.
pub const MAX_VARIANTS: usize = 4;
/// Maximum number of extracted keywords.
pub const MAX_KEYWORDS: usize = 3;

const EN_STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "could", "describe", "did",
    "do", "does", "explain", "for", "from", "give", "how", "i", "in", "is", "it", "me", "my",
    "of", "on", "or", "please", "should", "show", "tell", "that", "the", "there", "this", "to",
    "was", "we", "what", "whats", "when", "where", "which", "who", "whom", "why", "will", "with",
    "would", "you", "your",
];

const CJK_STOP_PHRASES: &[&str] = &[
    "为什么", "是什么", "什么是", "怎么样", "怎么", "如何", "什么", "哪些", "哪个", "是否",
    "有没有", "请问", "请", "介绍一下", "介绍", "一下", "关于", "有关", "怎样", "多少", "告诉我",
    "吗", "呢", "吧", "的", "了", "是", "和", "与", "在", "有", "我", "你",
    "とは", "ですか", "ますか", "について", "何", "どう", "의", "무엇", "어떻게",
];

/// Character-class counts of a text.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScriptCounts {
    pub han: usize,
    pub kana: usize,
    pub hangul: usize,
    pub latin: usize,
}

fn is_han(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF)
}

fn is_kana(c: char) -> bool {
    matches!(c as u32, 0x3040..=0x30FF | 0x31F0..=0x31FF)
}

fn is_hangul(c: char) -> bool {
    matches!(c as u32, 0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F)
}

fn is_cjk(c: char) -> bool {
    is_han(c) || is_kana(c) || is_hangul(c)
}

pub fn count_scripts(text: &str) -> ScriptCounts {
    let mut counts = ScriptCounts::default();
    for c in text.chars() {
        if is_han(c) {
            counts.han += 1;
        } else if is_kana(c) {
            counts.kana += 1;
        } else if is_hangul(c) {
            counts.hangul += 1;
        } else if c.is_alphabetic() && (c.is_ascii() || ('\u{00C0}'..='\u{024F}').contains(&c)) {
            counts.latin += 1;
        }
    }
    counts
}

/// Dominant language code of `text`: `"zh"`, `"ja"`, `"ko"`, `"en"`, or
/// `None` when the text has no letters at all.
///
/// Latin script maps to `"en"`; ideographs with any kana map to `"ja"`.
pub fn detect_language(text: &str) -> Option<&'static str> {
    let c = count_scripts(text);
    let cjk = c.han + c.kana + c.hangul;
    if cjk == 0 && c.latin == 0 {
        return None;
    }
    // One ideograph carries roughly as much as a short Latin word.
    if cjk * 3 >= c.latin {
        if c.hangul > c.han + c.kana {
            Some("ko")
        } else if c.kana > 0 {
            Some("ja")
        } else {
            Some("zh")
        }
    } else {
        Some("en")
    }
}

/// Lower-case, whitespace-collapsed form of a query; used as a cache key.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Up to [`MAX_KEYWORDS`] core terms of a query, interrogatives and stop
/// words removed, in order of appearance.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut text = query.to_lowercase();
    let has_cjk = text.chars().any(is_cjk);
    if has_cjk {
        for phrase in CJK_STOP_PHRASES {
            text = text.replace(phrase, " ");
        }
    }

    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for raw in text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_')) {
        let word = raw.trim_matches(|c: char| c == '-' || c == '_');
        if word.is_empty() {
            continue;
        }
        let cjk_word = word.chars().any(is_cjk);
        let long_enough = if cjk_word {
            word.chars().count() >= 2
        } else {
            word.chars().count() >= 3
        };
        if !long_enough || (!cjk_word && EN_STOP_WORDS.contains(&word)) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
        }
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }
    keywords
}

/// Build the query variants searched for a cross-language query.
///
/// Priority order: the original, the translation, a two-keyword
/// combination, then individual keywords; duplicates (by
/// [`normalize_query`]) are dropped and the list is capped at
/// [`MAX_VARIANTS`].
pub fn query_variants(original: &str, keywords: &[String], translation: Option<&str>) -> Vec<String> {
    let mut candidates: Vec<String> = vec![original.trim().to_string()];
    if let Some(t) = translation {
        candidates.push(t.trim().to_string());
    }
    if keywords.len() >= 2 {
        candidates.push(format!("{} {}", keywords[0], keywords[1]));
    }
    candidates.extend(keywords.iter().cloned());

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| !c.is_empty() && seen.insert(normalize_query(c)))
        .take(MAX_VARIANTS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_chinese() {
        assert_eq!(detect_language("如何配置向量数据库？"), Some("zh"));
    }

    #[test]
    fn detects_english() {
        assert_eq!(detect_language("How do I configure the vector store?"), Some("en"));
    }

    #[test]
    fn mixed_query_with_few_ideographs_is_cjk() {
        // 6 ideographs vs 7 latin letters.
        assert_eq!(detect_language("LanceDB 的配置方法是"), Some("zh"));
    }

    #[test]
    fn detects_japanese_and_korean() {
        assert_eq!(detect_language("ベクトル検索とは"), Some("ja"));
        assert_eq!(detect_language("벡터 검색이란 무엇입니까"), Some("ko"));
    }

    #[test]
    fn no_letters_means_unknown() {
        assert_eq!(detect_language("1234 ?!"), None);
    }

    #[test]
    fn english_keywords_drop_stop_words() {
        let kw = extract_keywords("What is the retention policy for audit logs?");
        assert_eq!(kw, vec!["retention", "policy", "audit"]);
    }

    #[test]
    fn chinese_keywords_drop_interrogatives() {
        let kw = extract_keywords("什么是向量数据库的索引？");
        assert!(!kw.is_empty());
        assert!(kw.iter().all(|k| !k.contains("什么")));
        assert!(kw.iter().any(|k| k.contains("向量数据库")));
    }

    #[test]
    fn variants_are_capped_and_deduplicated() {
        let kw = vec!["retention".to_string(), "policy".to_string(), "audit".to_string()];
        let v = query_variants("保留策略是什么", &kw, Some("What is the retention policy"));
        assert_eq!(v.len(), MAX_VARIANTS);
        assert_eq!(v[0], "保留策略是什么");
        assert_eq!(v[1], "What is the retention policy");
        assert_eq!(v[2], "retention policy");
        assert_eq!(v[3], "retention");
    }

    #[test]
    fn noop_translation_is_dropped() {
        let v = query_variants("Rust Tokio", &[], Some("  rust   tokio "));
        assert_eq!(v, vec!["Rust Tokio".to_string()]);
    }

    #[test]
    fn normalize_query_collapses() {
        assert_eq!(normalize_query("  Hello   World "), "hello world");
    }
}
