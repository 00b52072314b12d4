//! Allow-list of runnable scripts, built once from a flat directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Script file extension.
pub const SCRIPT_EXT: &str = "sh";

/// Whether `name` may name a script: ASCII alphanumerics, `_` and `-`,
/// not starting with `-`.
pub fn is_safe_command_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Mapping of command name to `<base_dir>/<name>.sh`.
#[derive(Debug, Clone, Default)]
pub struct ScriptCatalog {
    base_dir: PathBuf,
    scripts: BTreeMap<String, PathBuf>,
}

impl ScriptCatalog {
    /// Scan `base_dir` (not recursively) for `*.sh` regular files with safe names.
    pub fn scan(base_dir: &Path) -> std::io::Result<Self> {
        let mut scripts = BTreeMap::new();

        for entry in std::fs::read_dir(base_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map_or(true, |ext| ext != SCRIPT_EXT) {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_safe_command_name(stem) {
                tracing::warn!("Skipping script with unsafe name: {}", path.display());
                continue;
            }
            scripts.insert(stem.to_string(), path);
        }

        tracing::info!(
            "Found {} scripts in {}: {:?}",
            scripts.len(),
            base_dir.display(),
            scripts.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            scripts,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Script path for `command`, if it is allow-listed.
    pub fn resolve(&self, command: &str) -> Option<&Path> {
        if !is_safe_command_name(command) {
            return None;
        }
        self.scripts.get(command).map(PathBuf::as_path)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }

    /// Number of allow-listed scripts.
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn safe_names() {
        assert!(is_safe_command_name("deploy"));
        assert!(is_safe_command_name("oerr_2-x"));
        assert!(!is_safe_command_name(""));
        assert!(!is_safe_command_name("-rf"));
        assert!(!is_safe_command_name("../etc/passwd"));
        assert!(!is_safe_command_name("a/b"));
        assert!(!is_safe_command_name("a b"));
        assert!(!is_safe_command_name(".."));
    }

    #[test]
    fn scan_picks_flat_sh_files_only() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        std::fs::write(dir.join("doku.sh"), "echo doku").unwrap();
        std::fs::write(dir.join("notes.txt"), "nope").unwrap();
        std::fs::write(dir.join("bad name.sh"), "echo").unwrap();
        std::fs::create_dir(dir.join("nested.sh")).unwrap();
        std::fs::create_dir(dir.join("sub")).unwrap();
        std::fs::write(dir.join("sub").join("deep.sh"), "echo").unwrap();

        let catalog = ScriptCatalog::scan(dir).unwrap();

        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["doku"]);
        assert_eq!(catalog.len(), 1);
        assert!(!catalog.is_empty());
        assert_eq!(catalog.resolve("doku"), Some(dir.join("doku.sh").as_path()));
        assert_eq!(catalog.resolve("sub/deep"), None);
        assert_eq!(catalog.resolve("../doku"), None);
    }

    #[test]
    fn empty_directory_gives_empty_catalog() {
        let temp_dir = TempDir::new().unwrap();

        let catalog = ScriptCatalog::scan(temp_dir.path()).unwrap();

        assert!(catalog.is_empty());
        assert_eq!(catalog.len(), 0);
    }
}
