//! HTTPS Rewrite Rules
//!
//! Rule sets in the HTTPS Everywhere model: each ruleset has exclusion
//! patterns and ordered `from`/`to` regex substitutions, and a target
//! table maps (possibly wildcarded) hostnames to ruleset ids.
//!
//! ```json
//! { "targets": { "example.com": [1], "*.example.com": [1] },
//!   "rulesets": { "1": { "name": "Example",
//!                        "exclusion": [{ "pattern": "^http://example\\.com/legacy" }],
//!                        "rule": [{ "from": "^http://(www\\.)?example\\.com/",
//!                                   "to": "https://$1example.com/" }] } } }
//! ```

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum HttpsRulesError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("No usable rulesets")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct RulesData {
    targets: HashMap<String, Vec<u32>>,
    rulesets: HashMap<u32, RulesetData>,
}

#[derive(Debug, Deserialize)]
struct RulesetData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    default_off: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    exclusion: Vec<ExclusionData>,
    #[serde(default)]
    rule: Vec<RuleData>,
}

#[derive(Debug, Deserialize)]
struct ExclusionData {
    pattern: String,
}

#[derive(Debug, Deserialize)]
struct RuleData {
    from: String,
    to: String,
}

/// One compiled substitution
#[derive(Debug)]
pub struct RewriteRule {
    pub from: Regex,
    /// Replacement in `regex` syntax (`${1}`)
    pub to: String,
}

/// One compiled ruleset
#[derive(Debug)]
pub struct Ruleset {
    pub name: String,
    /// Rulesets that are off by default or platform-specific never apply
    pub active: bool,
    pub exclusions: Vec<Regex>,
    pub rules: Vec<RewriteRule>,
}

impl Ruleset {
    /// Patterns the `regex` crate rejects are dropped one by one
    fn compile(data: RulesetData) -> Self {
        let mut exclusions = Vec::with_capacity(data.exclusion.len());
        for exclusion in data.exclusion {
            match compile(&exclusion.pattern) {
                Ok(pattern) => exclusions.push(pattern),
                Err(e) => warn!("Skipping exclusion of {}: {}", data.name, e),
            }
        }

        let mut rules = Vec::with_capacity(data.rule.len());
        for rule in data.rule {
            match compile(&rule.from) {
                Ok(from) => rules.push(RewriteRule {
                    from,
                    to: convert_replacement(&rule.to),
                }),
                Err(e) => warn!("Skipping rule of {}: {}", data.name, e),
            }
        }

        Self {
            active: data.default_off.is_none() && data.platform.as_deref().is_none_or(str::is_empty),
            name: data.name,
            exclusions,
            rules,
        }
    }
}

/// Outcome of evaluating one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    NoMatch,
    /// An exclusion of the named ruleset matched; nothing may rewrite
    Excluded(String),
    /// Rewritten by the named ruleset
    Redirect { url: String, ruleset: String },
}

/// Queryable HTTPS rewrite rule set
#[derive(Debug)]
pub struct HttpsRules {
    targets: HashMap<String, Vec<u32>>,
    rulesets: HashMap<u32, Ruleset>,
}

impl HttpsRules {
    pub fn from_json(data: &[u8]) -> Result<Self, HttpsRulesError> {
        let data: RulesData = serde_json::from_slice(data)?;

        let rulesets = data
            .rulesets
            .into_iter()
            .map(|(id, ruleset)| (id, Ruleset::compile(ruleset)))
            .collect::<HashMap<_, _>>();
        if rulesets.is_empty() {
            return Err(HttpsRulesError::Empty);
        }

        let targets = data
            .targets
            .into_iter()
            .map(|(host, ids)| (host.to_ascii_lowercase(), ids))
            .collect::<HashMap<_, _>>();

        info!(
            "Loaded {} HTTPS rulesets for {} targets",
            rulesets.len(),
            targets.len()
        );
        Ok(Self { targets, rulesets })
    }

    pub fn ruleset_count(&self) -> usize {
        self.rulesets.len()
    }

    /// Candidate rulesets for a host, in pattern order, without duplicates
    fn candidates(&self, host: &str) -> Vec<&Ruleset> {
        let mut ids: Vec<u32> = Vec::new();
        for pattern in hostname_patterns(host) {
            if let Some(target_ids) = self.targets.get(&pattern) {
                for id in target_ids {
                    if !ids.contains(id) {
                        ids.push(*id);
                    }
                }
            }
        }
        ids.iter().filter_map(|id| self.rulesets.get(id)).collect()
    }

    /// Evaluate `url` against every applicable ruleset
    pub fn rewrite(&self, url: &Url) -> Rewrite {
        let Some(host) = url.host_str() else {
            return Rewrite::NoMatch;
        };
        let input = url.as_str();

        for ruleset in self.candidates(host) {
            if !ruleset.active {
                continue;
            }
            if ruleset.exclusions.iter().any(|e| e.is_match(input)) {
                debug!("{} excluded by ruleset {}", input, ruleset.name);
                return Rewrite::Excluded(ruleset.name.clone());
            }
            for rule in &ruleset.rules {
                let rewritten = rule.from.replace(input, rule.to.as_str());
                if rewritten != input {
                    return Rewrite::Redirect {
                        url: rewritten.into_owned(),
                        ruleset: ruleset.name.clone(),
                    };
                }
            }
        }
        Rewrite::NoMatch
    }
}

/// Target patterns that may list rulesets for `host`. For x.y.google.com:
/// the host itself, each label wildcarded in turn (`*.y.google.com`,
/// `x.*.google.com`, ...), then left-trimmed wildcards (`*.google.com`).
pub fn hostname_patterns(host: &str) -> Vec<String> {
    let host = host.to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    let mut patterns = vec![host.clone()];

    for (index, label) in labels.iter().enumerate() {
        if label.is_empty() {
            debug!("Host with an empty label: {}", host);
            continue;
        }
        let mut wildcarded = labels.clone();
        wildcarded[index] = "*";
        patterns.push(wildcarded.join("."));
    }

    for start in 2..labels.len().saturating_sub(1) {
        patterns.push(format!("*.{}", labels[start..].join(".")));
    }
    patterns
}

fn compile(pattern: &str) -> Result<Regex, HttpsRulesError> {
    Regex::new(pattern).map_err(|source| HttpsRulesError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

/// `$1` style group references become `${1}`
fn convert_replacement(to: &str) -> String {
    let mut out = String::with_capacity(to.len() + 8);
    let mut chars = to.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            if digits.is_empty() {
                out.push_str("$$");
            } else {
                out.push_str("${");
                out.push_str(&digits);
                out.push('}');
            }
        } else {
            out.push(c);
        }
    }
    out
}
