//! Minimal local stand-in for the (external, §1 Non-goals) Share subsystem:
//! scan the configured share directories and resolve virtual filenames to
//! local paths, the same way `mosaicfs-agent/src/crawler.rs` walks
//! `watch_paths` with `walkdir` to build its own file index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// Virtual filename → (local path, size in bytes).
#[derive(Debug, Clone, Default)]
pub struct LocalCatalog {
    entries: HashMap<String, (PathBuf, u64)>,
}

impl LocalCatalog {
    /// Walk every configured share path, indexing files under a virtual name
    /// relative to that share root (forward-slash separated, per §9 Open
    /// Question #3's wire convention).
    pub fn scan(share_paths: &[PathBuf]) -> Self {
        let mut entries = HashMap::new();
        for root in share_paths {
            for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(root) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let virtual_filename = to_virtual_filename(relative);
                let size = match entry.metadata() {
                    Ok(m) => m.len(),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "skipping unreadable share entry");
                        continue;
                    }
                };
                entries.insert(virtual_filename, (entry.path().to_path_buf(), size));
            }
        }
        Self { entries }
    }

    pub fn resolve(&self, virtual_filename: &str) -> Option<&Path> {
        self.entries.get(virtual_filename).map(|(path, _)| path.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON `{virtual_filename: size}`, the shape `POST /shares/{token}`'s
    /// `shares` part expects (§4.5.1).
    pub fn to_shares_json(&self) -> String {
        let descriptors: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|(name, (_, size))| serde_json::json!({"virtual_filename": name, "size": size}))
            .collect();
        serde_json::to_string(&descriptors).expect("serializing a Vec<Value> never fails")
    }
}

fn to_virtual_filename(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_indexes_nested_files() {
        let dir = tempfile_dir();
        fs::create_dir_all(dir.join("Music/Album")).unwrap();
        fs::write(dir.join("Music/Album/song.mp3"), b"1234").unwrap();

        let catalog = LocalCatalog::scan(&[dir.clone()]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.resolve("Music/Album/song.mp3").is_some());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn to_shares_json_round_trips_through_serde() {
        let dir = tempfile_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.txt"), b"hello").unwrap();
        let catalog = LocalCatalog::scan(&[dir.clone()]);
        let json = catalog.to_shares_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_array());
        fs::remove_dir_all(&dir).unwrap();
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir().join(format!("relay-agent-test-{}", uuid::Uuid::new_v4()))
    }
}
