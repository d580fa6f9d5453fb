use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Deny,
}

/// A domain pattern.
///
/// Patterns are stored lowercase with a trailing dot so they compare directly against
/// normalized query names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// Matches the domain itself and every name below it, e.g. `example.com`.
    Domain(String),

    /// Matches only names strictly below the domain, e.g. `*.example.com`.
    Subdomains(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub target: Target,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "PolicyDocument")]
pub struct Policy {
    pub default_action: Action,
    pub rules: Vec<Rule>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid policy document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: &'static str },
}

/// The wire form of a policy.
#[derive(Debug, Default, Deserialize, Serialize)]
struct PolicyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_action: Option<String>,

    #[serde(default)]
    egress: Vec<RuleDocument>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RuleDocument {
    action: String,
    target: String,
}

/// Lowercases `domain` and ensures it ends with a dot.
pub fn normalize(domain: &str) -> String {
    let mut fqdn = domain.trim().to_ascii_lowercase();
    if !fqdn.ends_with('.') {
        fqdn.push('.');
    }
    fqdn
}

// === impl Action ===

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            _ => Err(ParseError::UnknownAction(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

// === impl Target ===

impl Target {
    /// Tests a normalized (lowercase, dot-terminated) name against this pattern.
    pub fn matches(&self, fqdn: &str) -> bool {
        match self {
            Self::Domain(domain) => fqdn == domain || is_subdomain(fqdn, domain),
            Self::Subdomains(domain) => is_subdomain(fqdn, domain),
        }
    }
}

fn is_subdomain(fqdn: &str, domain: &str) -> bool {
    fqdn.len() > domain.len()
        && fqdn.ends_with(domain)
        && fqdn.as_bytes()[fqdn.len() - domain.len() - 1] == b'.'
}

impl FromStr for Target {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ParseError::InvalidTarget {
            target: s.to_string(),
            reason,
        };

        let pattern = s.trim().to_ascii_lowercase();
        let (wildcard, domain) = match pattern.strip_prefix("*.") {
            Some(domain) => (true, domain),
            None => (false, pattern.as_str()),
        };
        let domain = domain.strip_suffix('.').unwrap_or(domain);

        if domain.is_empty() {
            return Err(invalid("empty domain"));
        }
        if domain.len() > 253 {
            return Err(invalid("domain exceeds 253 characters"));
        }
        for label in domain.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(invalid("labels must be 1-63 characters"));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(invalid("labels must not begin or end with a hyphen"));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            {
                return Err(invalid("labels may only contain letters, digits, '-' and '_'"));
            }
        }

        let domain = format!("{domain}.");
        Ok(if wildcard {
            Self::Subdomains(domain)
        } else {
            Self::Domain(domain)
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(domain) => f.write_str(domain.trim_end_matches('.')),
            Self::Subdomains(domain) => write!(f, "*.{}", domain.trim_end_matches('.')),
        }
    }
}

// === impl Policy ===

impl Policy {
    /// Equivalent to having no policy installed.
    pub fn allow_all() -> Self {
        Self {
            default_action: Action::Allow,
            rules: Vec::new(),
        }
    }

    /// Parses a JSON policy document, e.g.
    ///
    /// ```json
    /// {"default_action": "deny", "egress": [{"action": "allow", "target": "pypi.org"}]}
    /// ```
    ///
    /// An omitted `default_action` means `deny`.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        serde_json::from_str::<PolicyDocument>(raw)?.try_into()
    }

    /// Returns the action of the first rule matching `domain`, or the default action.
    pub fn evaluate(&self, domain: &str) -> Action {
        let fqdn = normalize(domain);
        self.rules
            .iter()
            .find(|rule| rule.target.matches(&fqdn))
            .map(|rule| rule.action)
            .unwrap_or(self.default_action)
    }
}

impl TryFrom<PolicyDocument> for Policy {
    type Error = ParseError;

    fn try_from(doc: PolicyDocument) -> Result<Self, Self::Error> {
        let default_action = match doc.default_action {
            Some(action) => action.parse()?,
            None => Action::Deny,
        };
        let rules = doc
            .egress
            .into_iter()
            .map(|rule| -> Result<Rule, ParseError> {
                Ok(Rule {
                    action: rule.action.parse()?,
                    target: rule.target.parse()?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            default_action,
            rules,
        })
    }
}

impl From<Policy> for PolicyDocument {
    fn from(policy: Policy) -> Self {
        Self {
            default_action: Some(policy.default_action.to_string()),
            egress: policy
                .rules
                .into_iter()
                .map(|rule| RuleDocument {
                    action: rule.action.to_string(),
                    target: rule.target.to_string(),
                })
                .collect(),
        }
    }
}
