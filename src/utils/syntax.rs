use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use syntect::parsing::SyntaxSet;

static SYNTAX_SET: OnceLock<SyntaxSet> = OnceLock::new();

// Languages already resolved during this process, known or not.
static RESOLVED_LANGUAGES: Mutex<Option<HashSet<String>>> = Mutex::new(None);

fn syntax_set() -> &'static SyntaxSet {
    SYNTAX_SET.get_or_init(SyntaxSet::load_defaults_newlines)
}

pub(crate) fn normalize_lang_hint(s: &str) -> String {
    let t = s.trim().to_ascii_lowercase();
    match t.as_str() {
        "py" | "python" => "python".into(),
        "bash" | "sh" | "zsh" | "shell" => "bash".into(),
        "js" | "javascript" | "jsx" => "javascript".into(),
        "ts" | "tsx" | "typescript" => "typescript".into(),
        "yaml" | "yml" => "yaml".into(),
        "rust" | "rs" => "rust".into(),
        "c" | "h" => "c".into(),
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" => "cpp".into(),
        "kotlin" | "kt" => "kotlin".into(),
        other => other.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageLoad {
    /// First request for a language the highlighter knows.
    Loaded,
    /// First request for a language without a grammar; plain text is used.
    Unknown,
    /// The language was already resolved earlier in this process.
    AlreadyResolved,
}

/// Resolve a fenced-code language once per process.
pub fn ensure_language(lang_hint: &str) -> LanguageLoad {
    let lang = normalize_lang_hint(lang_hint);
    {
        let mut guard = RESOLVED_LANGUAGES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let resolved = guard.get_or_insert_with(HashSet::new);
        if !resolved.insert(lang.clone()) {
            return LanguageLoad::AlreadyResolved;
        }
    }

    if syntax_set().find_syntax_by_token(&lang).is_some() {
        LanguageLoad::Loaded
    } else {
        LanguageLoad::Unknown
    }
}
