//! Supported unit runtimes and their entry conventions.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Reserved argument that switches a unit into introspection mode.
pub const INTROSPECTION_FLAG: &str = "--_sys_get_schema";

/// Closed set of interpreters a unit may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Executed via the configured Python interpreter (`python3`).
    Python,
    /// Executed via the configured Node.js binary (`node`).
    Node,
    /// Executed via the configured shell (`bash`). Never has dependencies.
    Shell,
}

impl RuntimeKind {
    /// Detect the runtime from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Self::Python),
            "js" | "mjs" => Some(Self::Node),
            "sh" => Some(Self::Shell),
            _ => None,
        }
    }

    /// Stable lower-case name, also used as the cache sub-directory.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Shell => "shell",
        }
    }

    /// File names that make a directory a group unit (together with a
    /// declaration file, so shell never forms groups).
    pub fn group_entry_names(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["main.py"],
            Self::Node => &["main.js", "index.js"],
            Self::Shell => &[],
        }
    }

    /// Directory-level dependency declaration file name, if the runtime has one.
    pub fn declaration_file(self) -> Option<&'static str> {
        match self {
            Self::Python => Some("requirements.txt"),
            Self::Node => Some("package.json"),
            Self::Shell => None,
        }
    }

    /// Per-file declaration name (`<stem>_requirements.txt`, `<stem>_package.json`).
    pub fn sibling_declaration_file(self, stem: &str) -> Option<String> {
        self.declaration_file().map(|name| format!("{stem}_{name}"))
    }

    /// Whether `source` exposes the runtime's entry convention.
    pub fn has_entry_point(self, source: &str) -> bool {
        match self {
            Self::Python => python_main_guard().is_match(source),
            Self::Node => source.contains("module.exports") || source.contains("export default"),
            Self::Shell => source.starts_with("#!"),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn python_main_guard() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"if\s+__name__\s*==\s*["']__main__["']\s*:"#)
            .unwrap_or_else(|e| unreachable!("static regex is valid: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_runtime_from_extension() {
        assert_eq!(RuntimeKind::from_path(Path::new("a/b.py")), Some(RuntimeKind::Python));
        assert_eq!(RuntimeKind::from_path(Path::new("x.mjs")), Some(RuntimeKind::Node));
        assert_eq!(RuntimeKind::from_path(Path::new("x.sh")), Some(RuntimeKind::Shell));
        assert_eq!(RuntimeKind::from_path(Path::new("x.rb")), None);
        assert_eq!(RuntimeKind::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn python_entry_guard() {
        assert!(RuntimeKind::Python.has_entry_point("if __name__ == \"__main__\":\n    main()"));
        assert!(RuntimeKind::Python.has_entry_point("if __name__=='__main__':"));
        assert!(!RuntimeKind::Python.has_entry_point("def helper(): pass"));
    }

    #[test]
    fn node_entry_convention() {
        assert!(RuntimeKind::Node.has_entry_point("module.exports = run;"));
        assert!(RuntimeKind::Node.has_entry_point("export default function run() {}"));
        assert!(!RuntimeKind::Node.has_entry_point("console.log(1)"));
    }

    #[test]
    fn shell_requires_shebang() {
        assert!(RuntimeKind::Shell.has_entry_point("#!/bin/bash\necho hi"));
        assert!(!RuntimeKind::Shell.has_entry_point("echo hi"));
    }

    #[test]
    fn declaration_names() {
        assert_eq!(
            RuntimeKind::Python.sibling_declaration_file("weather").as_deref(),
            Some("weather_requirements.txt")
        );
        assert_eq!(RuntimeKind::Node.declaration_file(), Some("package.json"));
        assert_eq!(RuntimeKind::Shell.declaration_file(), None);
    }
}
