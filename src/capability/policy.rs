use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Wildcard pattern matching (simple glob: `*` matches any char sequence)
// ---------------------------------------------------------------------------

/// Match a capability name against a pattern that may contain `*` wildcards.
/// Examples: `file_*` matches `file_read`, `*_search` matches `web_search`.
pub fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut remaining = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !remaining.starts_with(part) {
                return false;
            }
            remaining = &remaining[part.len()..];
        } else if i == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

pub fn any_pattern_matches(patterns: &[&str], name: &str) -> bool {
    patterns.iter().any(|p| matches_wildcard(p, name))
}

fn trimmed_patterns(patterns: &[String]) -> Vec<&str> {
    patterns
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Run-wide limits layered on top of the role mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityPolicy {
    /// Empty allows everything.
    pub allow: Vec<String>,
    /// Applied after `allow`; a name matching both is denied.
    pub deny: Vec<String>,
    /// Capabilities whose loss fails the run instead of degrading it.
    pub mandatory: BTreeSet<String>,
}

impl CapabilityPolicy {
    pub fn permits(&self, name: &str) -> bool {
        let allow = trimmed_patterns(&self.allow);
        let deny = trimmed_patterns(&self.deny);
        let allowed = allow.is_empty() || any_pattern_matches(&allow, name);
        let denied = !deny.is_empty() && any_pattern_matches(&deny, name);
        if denied {
            tracing::debug!(capability = name, "capability denied by policy");
        }
        allowed && !denied
    }

    pub fn is_mandatory(&self, name: &str) -> bool {
        self.mandatory.contains(name)
    }
}
