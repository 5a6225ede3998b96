use serde::{Deserialize, Serialize};

/// Configuration tuple driving the sliding-window limiter for matching
/// paths (§3 "PathRule", §GLOSSARY). Pattern matching supports `*`
/// (single path segment) and `**` (any number of segments, including
/// zero) — no regex is exposed to configuration (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    pub pattern: String,

    pub window_seconds: u64,

    pub max_requests: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

/// Ordered, immutable snapshot of path rules (§9 "Path-rule hot reload":
/// atomic snapshot replacement, never a half-updated rule set — achieved
/// here simply by `PathRuleTable` being an owned `Vec` inside the
/// `ArcSwap<GatewayConfig>` the rest of the gateway already reloads
/// atomically).
#[derive(Debug, Clone, Default)]
pub struct PathRuleTable {
    rules: Vec<PathRule>,
}

impl PathRuleTable {
    pub fn new(rules: Vec<PathRule>) -> Self {
        Self { rules }
    }

    /// First enabled rule whose pattern matches `path`, in configuration
    /// order (§4.2 "Path-rule matching").
    pub fn resolve(&self, path: &str) -> Option<&PathRule> {
        self.rules
            .iter()
            .find(|r| r.enabled && pattern_matches(&r.pattern, path))
    }
}

/// `*` matches exactly one path segment; `**` matches any number of
/// segments including zero. Matching is segment-wise, not substring-wise.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_segs: Vec<&str> = split_segments(pattern);
    let path_segs: Vec<&str> = split_segments(path);
    match_segments(&pattern_segs, &path_segs)
}

fn split_segments(p: &str) -> Vec<&str> {
    p.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            // `**` may consume zero or more segments — try every split point.
            if pattern.len() == 1 {
                return true;
            }
            for i in 0..=path.len() {
                if match_segments(&pattern[1..], &path[i..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => {
            !path.is_empty() && match_segments(&pattern[1..], &path[1..])
        }
        Some(seg) => {
            !path.is_empty() && path[0] == *seg && match_segments(&pattern[1..], &path[1..])
        }
    }
}
