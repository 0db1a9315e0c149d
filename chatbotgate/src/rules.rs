//!
//! Per-path access rules.
//!
//! An ordered list of (matcher, action) pairs compiled from the config.
//! The first matching rule wins; paths nothing matches require
//! authentication.
//!

use serde::{Deserialize, Serialize};

/// What to do with a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Bypass authentication entirely.
    Allow,
    /// Require a valid session.
    Auth,
    /// Refuse the request outright.
    Deny,
}

/// One rule as it appears in the config file. Exactly one matcher field
/// must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    pub action: RuleAction,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    /// The empty prefix matches every path.
    Prefix(String),
    Regex(regex::Regex),
    /// minimatch-style: `*`, `**`, `?`, `[…]`, `{a,b}`.
    Glob(String),
    All,
}

impl Matcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Exact(s) => path == s,
            Matcher::Prefix(p) => path.starts_with(p.as_str()),
            Matcher::Regex(re) => re.is_match(path),
            Matcher::Glob(pattern) => fast_glob::glob_match(pattern, path),
            Matcher::All => true,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    matcher: Matcher,
    action: RuleAction,
}

/// The compiled, ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    rules: Vec<Rule>,
}

impl PathRules {
    /// Compile the configured rules, collecting every error instead of
    /// stopping at the first.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, Vec<String>> {
        let mut rules = Vec::with_capacity(configs.len());
        let mut errors = Vec::new();

        for (index, config) in configs.iter().enumerate() {
            match compile_matcher(config) {
                Ok(matcher) => rules.push(Rule {
                    matcher,
                    action: config.action,
                }),
                Err(error) => errors.push(format!("rule {}: {}", index + 1, error)),
            }
        }

        if errors.is_empty() {
            Ok(Self { rules })
        } else {
            Err(errors)
        }
    }

    /// First match wins; unmatched paths require authentication.
    pub fn evaluate(&self, path: &str) -> RuleAction {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(path))
            .map(|rule| rule.action)
            .unwrap_or(RuleAction::Auth)
    }
}

fn compile_matcher(config: &RuleConfig) -> Result<Matcher, String> {
    let mut matchers = Vec::new();

    if let Some(exact) = &config.exact {
        matchers.push(Matcher::Exact(exact.clone()));
    }
    if let Some(prefix) = &config.prefix {
        matchers.push(Matcher::Prefix(prefix.clone()));
    }
    if let Some(pattern) = &config.regex {
        let re = regex::Regex::new(pattern)
            .map_err(|e| format!("invalid regex {pattern:?}: {e}"))?;
        matchers.push(Matcher::Regex(re));
    }
    if let Some(glob) = &config.glob {
        if glob.is_empty() {
            return Err("glob pattern must not be empty".to_string());
        }
        matchers.push(Matcher::Glob(glob.clone()));
    }
    match config.all {
        Some(true) => matchers.push(Matcher::All),
        Some(false) => return Err("`all: false` is invalid; omit it or use `all: true`".to_string()),
        None => {}
    }

    match matchers.len() {
        0 => Err("a rule needs exactly one matcher (exact, prefix, regex, glob or all)".to_string()),
        1 => Ok(matchers.remove(0)),
        n => Err(format!("a rule needs exactly one matcher, found {n}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(action: RuleAction) -> RuleConfig {
        RuleConfig {
            exact: None,
            prefix: None,
            regex: None,
            glob: None,
            all: None,
            action,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = PathRules::compile(&[
            RuleConfig {
                prefix: Some("/public/".to_string()),
                ..rule(RuleAction::Allow)
            },
            RuleConfig {
                prefix: Some("/public/internal/".to_string()),
                ..rule(RuleAction::Deny)
            },
        ])
        .unwrap();

        // Declared order decides, not specificity.
        assert_eq!(rules.evaluate("/public/internal/x"), RuleAction::Allow);
    }

    #[test]
    fn test_default_action_is_auth() {
        let rules = PathRules::compile(&[]).unwrap();
        assert_eq!(rules.evaluate("/anything"), RuleAction::Auth);
    }

    #[test]
    fn test_matcher_variants() {
        let rules = PathRules::compile(&[
            RuleConfig {
                exact: Some("/healthz".to_string()),
                ..rule(RuleAction::Allow)
            },
            RuleConfig {
                regex: Some(r"^/admin(/.*)?$".to_string()),
                ..rule(RuleAction::Deny)
            },
            RuleConfig {
                glob: Some("/static/**".to_string()),
                ..rule(RuleAction::Allow)
            },
            RuleConfig {
                all: Some(true),
                ..rule(RuleAction::Auth)
            },
        ])
        .unwrap();

        assert_eq!(rules.evaluate("/healthz"), RuleAction::Allow);
        assert_eq!(rules.evaluate("/healthz2"), RuleAction::Auth);
        assert_eq!(rules.evaluate("/admin"), RuleAction::Deny);
        assert_eq!(rules.evaluate("/admin/users"), RuleAction::Deny);
        assert_eq!(rules.evaluate("/static/css/site.css"), RuleAction::Allow);
        assert_eq!(rules.evaluate("/app"), RuleAction::Auth);
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let rules = PathRules::compile(&[RuleConfig {
            prefix: Some(String::new()),
            ..rule(RuleAction::Allow)
        }])
        .unwrap();
        assert_eq!(rules.evaluate("/x"), RuleAction::Allow);
    }

    #[test]
    fn test_validation_collects_errors() {
        let errors = PathRules::compile(&[
            rule(RuleAction::Allow), // no matcher
            RuleConfig {
                exact: Some("/a".to_string()),
                prefix: Some("/b".to_string()),
                ..rule(RuleAction::Allow)
            },
            RuleConfig {
                regex: Some("(".to_string()),
                ..rule(RuleAction::Deny)
            },
            RuleConfig {
                all: Some(false),
                ..rule(RuleAction::Auth)
            },
        ])
        .unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors[0].starts_with("rule 1:"));
        assert!(errors[2].contains("invalid regex"));
        assert!(errors[3].contains("all: false"));
    }
}
