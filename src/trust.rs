//! Author trust classification.

use std::fmt;

use serde::Deserialize;

/// How far an author is trusted by the automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustTier {
    Copilot,
    TrustedBot,
    Maintainer,
    Untrusted,
}

impl TrustTier {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, TrustTier::Untrusted)
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustTier::Copilot => "copilot",
            TrustTier::TrustedBot => "trusted-bot",
            TrustTier::Maintainer => "maintainer",
            TrustTier::Untrusted => "untrusted",
        };
        f.write_str(s)
    }
}

/// Login lists backing each trust tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustPolicy {
    pub copilot_authors: Vec<String>,
    pub trusted_bots: Vec<String>,
    pub maintainers: Vec<String>,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            copilot_authors: vec!["Copilot".to_string(), "copilot-swe-agent".to_string()],
            trusted_bots: vec!["dependabot".to_string(), "github-actions".to_string()],
            maintainers: Vec::new(),
        }
    }
}

/// Strips the `[bot]` and `app/` decorations GitHub puts on app accounts.
fn normalise_login(login: &str) -> String {
    let login = login.trim();
    let login = login.strip_prefix("app/").unwrap_or(login);
    let login = login.strip_suffix("[bot]").unwrap_or(login);
    login.to_lowercase()
}

fn listed(list: &[String], login: &str) -> bool {
    list.iter().any(|entry| normalise_login(entry) == login)
}

impl TrustPolicy {
    /// Classifies an author login. The first matching tier wins, in the
    /// order Copilot, TrustedBot, Maintainer.
    pub fn classify_author(&self, login: &str) -> TrustTier {
        let login = normalise_login(login);
        if login.is_empty() {
            return TrustTier::Untrusted;
        }

        if listed(&self.copilot_authors, &login) {
            TrustTier::Copilot
        } else if listed(&self.trusted_bots, &login) {
            TrustTier::TrustedBot
        } else if listed(&self.maintainers, &login) {
            TrustTier::Maintainer
        } else {
            TrustTier::Untrusted
        }
    }
}
