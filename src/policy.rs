//! Score-to-verdict decision policy.

/// Abuse confidence score (0-100, higher = worse).
pub type ReputationScore = u8;

/// Scores strictly above this value are denied.
pub const DENY_SCORE_THRESHOLD: ReputationScore = 50;

/// Gate verdict for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Let the request through.
    Allow,
    /// Reject the request.
    Deny,
}

impl Verdict {
    /// Returns true for [`Verdict::Allow`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        }
    }
}

impl From<Verdict> for bool {
    fn from(verdict: Verdict) -> Self {
        verdict.is_allowed()
    }
}

impl From<bool> for Verdict {
    fn from(allowed: bool) -> Self {
        if allowed {
            Verdict::Allow
        } else {
            Verdict::Deny
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a confidence score to a verdict.
pub fn decide(score: ReputationScore) -> Verdict {
    if score > DENY_SCORE_THRESHOLD {
        Verdict::Deny
    } else {
        Verdict::Allow
    }
}
