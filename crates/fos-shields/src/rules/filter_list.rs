//! Filter List Parser (EasyList Format)
//!
//! Parses filter lists in EasyList/AdBlock Plus format into a queryable
//! rule set.
//! Supports:
//! - Domain anchors: ||example.com^ and ||example.com/ads/
//! - Start anchors: |https://ads.
//! - URL patterns with `*` wildcards and `^` separators: /ads/*.js^
//! - Exception rules: @@||allowed.com^
//! - Options: $third-party, $~third-party, resource types, $domain=
//! - Comments: ! or [Adblock Plus...]; element hiding rules are skipped
//!
//! Plain domain rules without options live in a [`HostSet`]; everything
//! else is matched linearly.

use super::host_set::HostSet;
use std::io::{BufRead, BufReader, Read};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Errors during filter list parsing
#[derive(Debug, Error)]
pub enum FilterListError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid rule on line {line} '{rule}': {reason}")]
    InvalidRule {
        line: usize,
        rule: String,
        reason: String,
    },

    #[error("Empty filter list")]
    EmptyList,
}

/// Resource types a rule can be restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterResourceType {
    Document,
    Subdocument,
    Stylesheet,
    Script,
    Image,
    Object,
    XmlHttpRequest,
    Other,
}

impl FilterResourceType {
    fn from_option(name: &str) -> Option<Self> {
        Some(match name {
            "document" => Self::Document,
            "subdocument" => Self::Subdocument,
            "stylesheet" => Self::Stylesheet,
            "script" => Self::Script,
            "image" => Self::Image,
            "object" => Self::Object,
            "xmlhttprequest" => Self::XmlHttpRequest,
            "other" => Self::Other,
            _ => return None,
        })
    }
}

/// Action to take when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Block the request
    Block,
    /// Allow the request (exception rule)
    Allow,
}

/// Type of filter rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// Host anchored: ||domain.com^
    DomainBlock,
    /// Pattern with wildcards or separators: /ads/*
    UrlPattern,
    /// Anchored at the start of the URL: |https://
    StartsWith,
    /// Plain substring
    Contains,
}

/// `$` options of a rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOptions {
    /// `Some(true)` for `$third-party`, `Some(false)` for `$~third-party`
    pub third_party: Option<bool>,
    pub include_types: Vec<FilterResourceType>,
    pub exclude_types: Vec<FilterResourceType>,
    /// First-party domains from `$domain=`
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

impl RuleOptions {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn parse(options: &str) -> Result<Self, String> {
        let mut parsed = Self::default();
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (negated, name) = match option.strip_prefix('~') {
                Some(name) => (true, name),
                None => (false, option),
            };

            if let Some(domains) = name.strip_prefix("domain=") {
                if negated {
                    return Err("negated domain option".to_string());
                }
                for domain in domains.split('|').filter(|d| !d.is_empty()) {
                    match domain.strip_prefix('~') {
                        Some(excluded) => parsed.exclude_domains.push(excluded.to_ascii_lowercase()),
                        None => parsed.include_domains.push(domain.to_ascii_lowercase()),
                    }
                }
                continue;
            }

            match name {
                "third-party" => parsed.third_party = Some(!negated),
                "first-party" => parsed.third_party = Some(negated),
                _ => match FilterResourceType::from_option(name) {
                    Some(t) if negated => parsed.exclude_types.push(t),
                    Some(t) => parsed.include_types.push(t),
                    None => return Err(format!("unsupported option '{}'", option)),
                },
            }
        }
        Ok(parsed)
    }

    fn applies(&self, request: &MatchRequest<'_>) -> bool {
        if let Some(third_party) = self.third_party {
            if third_party != request.third_party {
                return false;
            }
        }
        if !self.include_types.is_empty() && !self.include_types.contains(&request.resource_type) {
            return false;
        }
        if self.exclude_types.contains(&request.resource_type) {
            return false;
        }
        let first_party = request.first_party_host;
        if !self.include_domains.is_empty()
            && !self.include_domains.iter().any(|d| host_matches(first_party, d))
        {
            return false;
        }
        !self.exclude_domains.iter().any(|d| host_matches(first_party, d))
    }
}

/// A single filter rule
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Original rule text
    pub raw: String,
    /// Lowercased pattern; the host for domain rules
    pub pattern: String,
    /// Part after the host for domain rules, e.g. `^` or `/ads/`
    pub remainder: Option<String>,
    pub rule_type: RuleType,
    pub action: FilterAction,
    pub options: RuleOptions,
}

impl FilterRule {
    /// Check if this rule matches a request; `url` must be lowercase
    pub fn matches(&self, url: &str, request: &MatchRequest<'_>) -> bool {
        if !self.options.applies(request) {
            return false;
        }
        let url = url.as_bytes();
        match self.rule_type {
            RuleType::DomainBlock => {
                if !host_matches(request.host, &self.pattern) {
                    return false;
                }
                match &self.remainder {
                    Some(rest) => match_here(after_host(url), rest.as_bytes()),
                    None => true,
                }
            }
            RuleType::StartsWith => match_here(url, self.pattern.as_bytes()),
            RuleType::UrlPattern | RuleType::Contains => match_anywhere(url, self.pattern.as_bytes()),
        }
    }

    /// Whether this rule can live in the host fast path
    fn is_plain_domain(&self) -> bool {
        self.rule_type == RuleType::DomainBlock && self.remainder.is_none() && self.options.is_empty()
    }
}

/// What the matcher needs to know about a request
#[derive(Debug, Clone, Copy)]
pub struct MatchRequest<'a> {
    pub url: &'a str,
    /// Lowercase request host
    pub host: &'a str,
    pub resource_type: FilterResourceType,
    /// Lowercase host of the main frame
    pub first_party_host: &'a str,
    pub third_party: bool,
}

/// Result of checking one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMatch {
    NoMatch,
    /// Blocked by the rule shown
    Blocked(String),
    /// A block rule matched but this exception overrode it
    Excepted(String),
}

impl FilterMatch {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// A complete filter list
pub struct FilterList {
    /// Name of the filter list
    pub name: String,
    /// Blocking rules not covered by `blocked_domains`
    pub block_rules: Vec<FilterRule>,
    /// Exception rules not covered by `allowed_domains`
    pub exception_rules: Vec<FilterRule>,
    /// Fast path for `||domain^` block rules
    pub blocked_domains: HostSet,
    /// Fast path for `@@||domain^` exceptions
    pub allowed_domains: HostSet,
    rule_count: usize,
}

impl FilterList {
    /// Create an empty filter list
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            block_rules: Vec::new(),
            exception_rules: Vec::new(),
            blocked_domains: HostSet::new(),
            allowed_domains: HostSet::new(),
            rule_count: 0,
        }
    }

    /// Parse a downloaded list, skipping rules this matcher cannot express
    pub fn parse<R: Read>(name: &str, reader: R) -> Result<Self, FilterListError> {
        let buf_reader = BufReader::new(reader);
        let mut list = Self::new(name);
        let mut line_count = 0;
        let mut skipped = 0;

        for line in buf_reader.lines() {
            let line = line?;
            line_count += 1;

            match Self::parse_rule(&line) {
                Ok(Some(rule)) => list.add_rule(rule),
                Ok(None) => {}
                Err(reason) => {
                    skipped += 1;
                    trace!("Skipping rule '{}': {}", line.trim(), reason);
                }
            }
        }

        if list.rule_count == 0 {
            return Err(FilterListError::EmptyList);
        }

        info!(
            "Parsed filter list '{}': {} lines, {} rules ({} block, {} exception), {} domains, {} skipped",
            name,
            line_count,
            list.rule_count,
            list.block_rules.len() + list.blocked_domains.len(),
            list.exception_rules.len() + list.allowed_domains.len(),
            list.blocked_domains.len(),
            skipped
        );

        Ok(list)
    }

    /// Parse raw bytes as handed over by the data file manager
    pub fn parse_bytes(name: &str, data: &[u8]) -> Result<Self, FilterListError> {
        Self::parse(name, data)
    }

    /// Parse user-written rules. Every non-comment line must be a valid
    /// rule; empty text yields an empty list.
    pub fn parse_custom(name: &str, text: &str) -> Result<Self, FilterListError> {
        let mut list = Self::new(name);
        for (index, line) in text.lines().enumerate() {
            match Self::parse_rule(line) {
                Ok(Some(rule)) => list.add_rule(rule),
                Ok(None) => {}
                Err(reason) => {
                    return Err(FilterListError::InvalidRule {
                        line: index + 1,
                        rule: line.trim().to_string(),
                        reason,
                    });
                }
            }
        }
        debug!("Parsed {} custom rules for '{}'", list.rule_count, name);
        Ok(list)
    }

    fn add_rule(&mut self, rule: FilterRule) {
        self.rule_count += 1;
        match (rule.action, rule.is_plain_domain()) {
            (FilterAction::Block, true) => self.blocked_domains.insert(&rule.pattern),
            (FilterAction::Block, false) => self.block_rules.push(rule),
            (FilterAction::Allow, true) => self.allowed_domains.insert(&rule.pattern),
            (FilterAction::Allow, false) => self.exception_rules.push(rule),
        }
    }

    /// Parse a single rule line. `Ok(None)` for lines that carry no
    /// network rule (blank, comments, element hiding).
    fn parse_rule(line: &str) -> Result<Option<FilterRule>, String> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
            return Ok(None);
        }
        if ["##", "#@#", "#?#", "#$#"].iter().any(|m| trimmed.contains(m)) {
            return Ok(None);
        }

        let (action, body) = match trimmed.strip_prefix("@@") {
            Some(rest) => (FilterAction::Allow, rest),
            None => (FilterAction::Block, trimmed),
        };

        if body.len() > 2 && body.starts_with('/') && body.ends_with('/') {
            return Err("regular expression rules are not supported".to_string());
        }

        let (pattern, options) = match body.rfind('$') {
            Some(pos) => (&body[..pos], RuleOptions::parse(&body[pos + 1..])?),
            None => (body, RuleOptions::default()),
        };

        Self::parse_pattern(trimmed, pattern, action, options).map(Some)
    }

    /// Parse the pattern part of a rule
    fn parse_pattern(
        raw: &str,
        pattern: &str,
        action: FilterAction,
        options: RuleOptions,
    ) -> Result<FilterRule, String> {
        let rule = |pattern: String, remainder: Option<String>, rule_type| FilterRule {
            raw: raw.to_string(),
            pattern,
            remainder,
            rule_type,
            action,
            options: options.clone(),
        };

        // Domain anchor: ||domain.com^ or ||domain.com/path
        if let Some(rest) = pattern.strip_prefix("||") {
            let end = rest
                .find(|c: char| matches!(c, '^' | '/' | '*' | '|' | ':' | '?'))
                .unwrap_or(rest.len());
            let host = rest[..end].to_ascii_lowercase();
            if host.is_empty() || !host.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
                return Err("invalid host".to_string());
            }
            let remainder = match &rest[end..] {
                "" | "^" => None,
                other => Some(other.to_ascii_lowercase()),
            };
            return Ok(rule(host, remainder, RuleType::DomainBlock));
        }

        // Start-of-URL match: |https://
        if let Some(rest) = pattern.strip_prefix('|') {
            if rest.is_empty() {
                return Err("empty pattern".to_string());
            }
            return Ok(rule(rest.to_ascii_lowercase(), None, RuleType::StartsWith));
        }

        let significant = pattern.chars().filter(|c| !matches!(c, '*' | '^' | '|')).count();

        // URL pattern with wildcards or separators
        if pattern.contains(['/', '*', '^']) {
            if significant < 3 {
                return Err("pattern too short, would match too much".to_string());
            }
            let clean = pattern.trim_start_matches('*').to_ascii_lowercase();
            return Ok(rule(clean, None, RuleType::UrlPattern));
        }

        // Plain string match (contains)
        if significant >= 5 {
            return Ok(rule(pattern.to_ascii_lowercase(), None, RuleType::Contains));
        }

        Err("pattern too short, would match too much".to_string())
    }

    /// Check a request against the list. Exceptions win over blocks.
    pub fn check(&self, request: &MatchRequest<'_>) -> FilterMatch {
        let url = request.url.to_ascii_lowercase();

        let blocked = match self.blocked_domains.matching_suffix(request.host) {
            Some(domain) => Some(format!("||{}^", domain)),
            None => self
                .block_rules
                .iter()
                .find(|rule| rule.matches(&url, request))
                .map(|rule| rule.raw.clone()),
        };
        let Some(blocked) = blocked else {
            return FilterMatch::NoMatch;
        };

        if let Some(domain) = self.allowed_domains.matching_suffix(request.host) {
            debug!("{} allowed by exception for {}", request.url, domain);
            return FilterMatch::Excepted(format!("@@||{}^", domain));
        }
        if let Some(rule) = self.exception_rules.iter().find(|rule| rule.matches(&url, request)) {
            debug!("{} allowed by exception '{}'", request.url, rule.raw);
            return FilterMatch::Excepted(rule.raw.clone());
        }

        debug!("{} blocked by '{}'", request.url, blocked);
        FilterMatch::Blocked(blocked)
    }

    /// Check if a request should be blocked
    pub fn should_block(&self, request: &MatchRequest<'_>) -> bool {
        self.check(request).is_blocked()
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }
}

/// `host` equals `domain` or is a subdomain of it
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// The part of a URL after its host (port, path, query)
fn after_host(url: &[u8]) -> &[u8] {
    let start = url
        .windows(3)
        .position(|w| w == b"://")
        .map(|p| p + 3)
        .unwrap_or(0);
    let rest = &url[start..];
    let end = rest
        .iter()
        .position(|c| matches!(c, b'/' | b'?' | b'#' | b':'))
        .unwrap_or(rest.len());
    &rest[end..]
}

/// Characters a `^` placeholder matches
fn is_separator(c: u8) -> bool {
    !(c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b'%'))
}

/// Match `pattern` against a prefix of `text`. `*` matches any run,
/// `^` a separator or the end of the URL, and a trailing `|` anchors the
/// end.
fn match_here(text: &[u8], pattern: &[u8]) -> bool {
    wildcard_match(text, pattern, true)
}

/// Like [`match_here`], but the match may start anywhere in `text`
fn match_anywhere(text: &[u8], pattern: &[u8]) -> bool {
    wildcard_match(text, pattern, false)
}

/// Iterative matcher that only ever backtracks to the last `*`, so the
/// cost stays within `text.len() * pattern.len()` however many
/// wildcards a rule carries.
fn wildcard_match(text: &[u8], pattern: &[u8], anchored: bool) -> bool {
    let (mut t, mut p) = (0, 0);
    // Pattern index after the last `*` and the text index it resumes from
    let mut star = if anchored { None } else { Some((0, 0)) };

    while p < pattern.len() {
        let step = match pattern[p] {
            b'*' => {
                star = Some((p + 1, t));
                p += 1;
                continue;
            }
            b'^' => match text.get(t) {
                None => Some(0),
                Some(&c) if is_separator(c) => Some(1),
                Some(_) => None,
            },
            b'|' if p + 1 == pattern.len() => (t == text.len()).then_some(0),
            c => (text.get(t) == Some(&c)).then_some(1),
        };
        match (step, star) {
            (Some(width), _) => {
                t += width;
                p += 1;
            }
            (None, Some((resume, from))) if from < text.len() => {
                star = Some((resume, from + 1));
                p = resume;
                t = from + 1;
            }
            (None, _) => return false,
        }
    }
    true
}
