//! Dependency declarations: lookup, parsing and content digest.
//!
//! A declaration is the ordered list of package specifiers a unit needs,
//! tagged with its runtime. Its digest is the dependency-cache key, so two
//! units with the same specifiers and runtime share one installed set.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::runtime::RuntimeKind;
use crate::hashing::sha256_hex_parts;

/// Ordered package specifiers for one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    pub runtime: RuntimeKind,
    pub specifiers: Vec<String>,
    /// File the declaration was read from (`None` when the unit has none).
    pub source: Option<PathBuf>,
}

impl DependencyDeclaration {
    /// A declaration with no packages.
    pub fn empty(runtime: RuntimeKind) -> Self {
        Self {
            runtime,
            specifiers: Vec::new(),
            source: None,
        }
    }

    /// Parse declaration file text for `runtime`.
    pub fn parse(runtime: RuntimeKind, text: &str) -> Self {
        let specifiers = match runtime {
            RuntimeKind::Python => parse_requirements(text),
            RuntimeKind::Node => parse_package_json(text),
            RuntimeKind::Shell => Vec::new(),
        };
        Self {
            runtime,
            specifiers,
            source: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.specifiers.is_empty()
    }

    /// Content digest used as the cache key. Ignores `source`.
    pub fn digest(&self) -> String {
        let joined = self.specifiers.join("\n");
        sha256_hex_parts([self.runtime.as_str().as_bytes(), joined.as_bytes()])
    }

    /// Read the declaration that applies to `entry`.
    ///
    /// Lookup order: a sibling `<stem>_<file>` next to the entry, then the
    /// nearest `<file>` walking from the entry's directory up to `root`.
    /// The nearest directory wins, so a group-level declaration overrides a
    /// top-level one.
    pub async fn load_for(
        entry: &Path,
        root: &Path,
        runtime: RuntimeKind,
    ) -> std::io::Result<Self> {
        let Some(path) = locate(entry, root, runtime).await else {
            return Ok(Self::empty(runtime));
        };
        let text = tokio::fs::read_to_string(&path).await?;
        let mut declaration = Self::parse(runtime, &text);
        declaration.source = Some(path);
        Ok(declaration)
    }
}

/// Find the declaration file that applies to `entry`, if any.
pub async fn locate(entry: &Path, root: &Path, runtime: RuntimeKind) -> Option<PathBuf> {
    let file_name = runtime.declaration_file()?;
    let entry_dir = entry.parent()?;

    if let Some(stem) = entry.file_stem().and_then(|s| s.to_str()) {
        if let Some(sibling) = runtime.sibling_declaration_file(stem) {
            let candidate = entry_dir.join(sibling);
            if is_file(&candidate).await {
                return Some(candidate);
            }
        }
    }

    let mut dir = Some(entry_dir);
    while let Some(current) = dir {
        let candidate = current.join(file_name);
        if is_file(&candidate).await {
            return Some(candidate);
        }
        if current == root || !current.starts_with(root) {
            break;
        }
        dir = current.parent();
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Parse `requirements.txt`: one specifier per line, comments and blanks dropped.
pub fn parse_requirements(text: &str) -> Vec<String> {
    // pip only treats `#` as a comment at line start or after whitespace
    // (`pkg @ git+https://host/repo#egg=pkg` keeps its fragment).
    text.lines()
        .map(|line| {
            let line = line.trim();
            if line.starts_with('#') {
                return "";
            }
            line.split(" #").next().unwrap_or_default().trim()
        })
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `package.json` `dependencies` and `devDependencies` into
/// `name@version` specifiers.
///
/// Text that is not JSON is read as one specifier per line.
pub fn parse_package_json(text: &str) -> Vec<String> {
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(text) else {
        return text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("//"))
            .map(str::to_string)
            .collect();
    };

    ["dependencies", "devDependencies"]
        .iter()
        .filter_map(|section| doc.get(section).and_then(|v| v.as_object()))
        .flat_map(|deps| deps.iter())
        .map(|(name, version)| match version.as_str().map(str::trim) {
            Some(v) if !v.is_empty() => format!("{name}@{v}"),
            _ => name.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_drop_comments_and_blanks() {
        let specs = parse_requirements("# tools\nrequests==2.31.0\n\nnumpy>=1.24  # pinned later\n");
        assert_eq!(specs, ["requests==2.31.0", "numpy>=1.24"]);
    }

    #[test]
    fn package_json_merges_sections() {
        let specs = parse_package_json(
            r#"{"name":"x","dependencies":{"axios":"^1.6.0"},"devDependencies":{"jest":""}}"#,
        );
        assert_eq!(specs, ["axios@^1.6.0", "jest"]);
    }

    #[test]
    fn package_json_falls_back_to_lines() {
        assert_eq!(parse_package_json("lodash@4\n// note\nchalk"), ["lodash@4", "chalk"]);
    }

    #[test]
    fn identical_content_shares_digest_regardless_of_source() {
        let mut a = DependencyDeclaration::parse(RuntimeKind::Python, "requests==2.31.0\n");
        let mut b = DependencyDeclaration::parse(RuntimeKind::Python, "requests==2.31.0");
        a.source = Some(PathBuf::from("a/requirements.txt"));
        b.source = Some(PathBuf::from("b/requirements.txt"));
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn runtime_is_part_of_the_digest() {
        let py = DependencyDeclaration::empty(RuntimeKind::Python);
        let node = DependencyDeclaration::empty(RuntimeKind::Node);
        assert_ne!(py.digest(), node.digest());
    }

    #[test]
    fn order_is_part_of_the_digest() {
        let a = DependencyDeclaration::parse(RuntimeKind::Python, "a\nb");
        let b = DependencyDeclaration::parse(RuntimeKind::Python, "b\na");
        assert_ne!(a.digest(), b.digest());
    }

    #[tokio::test]
    async fn nearest_declaration_wins() {
        let root = tempfile::tempdir().expect("tempdir");
        let group = root.path().join("group");
        std::fs::create_dir_all(&group).expect("mkdir");
        std::fs::write(root.path().join("requirements.txt"), "top").expect("write");
        std::fs::write(group.join("requirements.txt"), "group").expect("write");

        let top_level = DependencyDeclaration::load_for(
            &root.path().join("tool.py"),
            root.path(),
            RuntimeKind::Python,
        )
        .await
        .expect("load");
        assert_eq!(top_level.specifiers, ["top"]);

        let grouped =
            DependencyDeclaration::load_for(&group.join("main.py"), root.path(), RuntimeKind::Python)
                .await
                .expect("load");
        assert_eq!(grouped.specifiers, ["group"]);
    }

    #[tokio::test]
    async fn sibling_declaration_beats_directory_file() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join("requirements.txt"), "shared").expect("write");
        std::fs::write(root.path().join("weather_requirements.txt"), "own").expect("write");

        let decl = DependencyDeclaration::load_for(
            &root.path().join("weather.py"),
            root.path(),
            RuntimeKind::Python,
        )
        .await
        .expect("load");
        assert_eq!(decl.specifiers, ["own"]);
        assert!(decl.source.expect("source").ends_with("weather_requirements.txt"));
    }

    #[tokio::test]
    async fn shell_units_never_have_dependencies() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join("requirements.txt"), "x").expect("write");
        let decl =
            DependencyDeclaration::load_for(&root.path().join("a.sh"), root.path(), RuntimeKind::Shell)
                .await
                .expect("load");
        assert!(decl.is_empty());
        assert!(decl.source.is_none());
    }
}
