//! Glob-style ignore patterns for the unit tree walk.
//!
//! Patterns use shell wildcards (`*`, `?`, `[...]`) and are matched against
//! single path components, so `node_modules` prunes the directory wherever
//! it appears and `.*` skips every dotfile.

use regex::Regex;

/// Compiled set of ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Regex>,
}

impl IgnoreSet {
    /// Compile `patterns`. Patterns that cannot be compiled are skipped
    /// with a warning.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                let p = p.as_ref().trim().trim_end_matches('/');
                if p.is_empty() {
                    return None;
                }
                match Regex::new(&glob_to_regex(p)) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern = p, error = %e, "Ignoring invalid scan ignore pattern");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether a file or directory name matches any pattern.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

/// Translate a shell glob into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' && !class.is_empty() {
                        closed = true;
                        break;
                    }
                    class.push(next);
                }
                if closed {
                    out.push('[');
                    if let Some(rest) = class.strip_prefix('!') {
                        out.push('^');
                        out.push_str(&rest.replace('\\', "\\\\"));
                    } else {
                        out.push_str(&class.replace('\\', "\\\\"));
                    }
                    out.push(']');
                } else {
                    out.push_str(&regex::escape(&format!("[{class}")));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}
