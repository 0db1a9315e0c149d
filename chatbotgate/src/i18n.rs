//!
//! Localization catalogs for the rendered pages and emails.
//!
//! Catalogs are embedded at build time. Lookup falls back to English and
//! finally to the key itself, so a missing translation never breaks a page.
//!

use std::collections::HashMap;

const EN: &str = include_str!("../locales/en.json");
const JA: &str = include_str!("../locales/ja.json");

const FALLBACK_LANG: &str = "en";

#[derive(Debug, Clone)]
pub struct Translator {
    catalogs: HashMap<String, HashMap<String, String>>,
    default_lang: String,
}

fn parse_catalog(raw: &str) -> HashMap<String, String> {
    // The embedded catalogs are fixed at build time; a parse failure is a
    // build defect, not a runtime condition.
    serde_json::from_str(raw).expect("embedded locale catalog is valid JSON")
}

impl Translator {
    pub fn new(default_lang: &str) -> Self {
        let mut catalogs = HashMap::new();
        catalogs.insert("en".to_string(), parse_catalog(EN));
        catalogs.insert("ja".to_string(), parse_catalog(JA));
        let default_lang = if catalogs.contains_key(default_lang) {
            default_lang.to_string()
        } else {
            FALLBACK_LANG.to_string()
        };
        Self {
            catalogs,
            default_lang,
        }
    }

    pub fn default_lang(&self) -> &str {
        &self.default_lang
    }

    /// Pick the best supported language from an `Accept-Language` header.
    pub fn resolve_lang(&self, accept_language: Option<&str>) -> String {
        if let Some(header) = accept_language {
            for part in header.split(',') {
                let tag = part.split(';').next().unwrap_or("").trim().to_lowercase();
                let primary = tag.split('-').next().unwrap_or("");
                if self.catalogs.contains_key(primary) {
                    return primary.to_string();
                }
            }
        }
        self.default_lang.clone()
    }

    /// Translate `key`, substituting `{name}` placeholders from `args`.
    pub fn t(&self, lang: &str, key: &str, args: &[(&str, &str)]) -> String {
        let text = self
            .catalogs
            .get(lang)
            .and_then(|c| c.get(key))
            .or_else(|| self.catalogs.get(FALLBACK_LANG).and_then(|c| c.get(key)))
            .cloned()
            .unwrap_or_else(|| key.to_string());
        args.iter().fold(text, |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_substitution() {
        let t = Translator::new("en");
        assert_eq!(
            t.t("en", "login.heading", &[("service", "ChatbotGate")]),
            "Sign in to ChatbotGate"
        );
    }

    #[test]
    fn test_japanese_catalog() {
        let t = Translator::new("ja");
        let text = t.t("ja", "login.heading", &[("service", "Gate")]);
        assert!(text.contains("Gate"));
        assert!(text.contains("ログイン"));
    }

    #[test]
    fn test_missing_key_falls_back_to_key() {
        let t = Translator::new("en");
        assert_eq!(t.t("en", "no.such.key", &[]), "no.such.key");
    }

    #[test]
    fn test_unknown_lang_falls_back_to_english() {
        let t = Translator::new("en");
        assert_eq!(t.t("fr", "login.title", &[]), "Sign in");
    }

    #[test]
    fn test_resolve_lang() {
        let t = Translator::new("en");
        assert_eq!(t.resolve_lang(Some("ja,en;q=0.8")), "ja");
        assert_eq!(t.resolve_lang(Some("ja-JP;q=0.9, en;q=0.8")), "ja");
        assert_eq!(t.resolve_lang(Some("fr-FR, de")), "en");
        assert_eq!(t.resolve_lang(None), "en");
    }

    #[test]
    fn test_unsupported_default_lang_falls_back() {
        let t = Translator::new("xx");
        assert_eq!(t.default_lang(), "en");
    }
}
