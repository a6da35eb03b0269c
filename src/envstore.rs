/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/envstore.rs
 *
 * The side-channel env-file store (C2). Two instances of this type exist per
 * run: one over the human-maintained `base` file (read-only to the core) and
 * one over the machine-maintained `generated` file. Both share the same
 * parse/write mechanics; the distinction between "base" and "generated" is
 * purely a matter of which methods the caller chooses to invoke (the merge
 * logic in `Merged::load` never calls `Write` on the base store).
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::ClusterId;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Keys that are never read from `base`: gateway-endpoint variables. These
/// are only ever discovered at runtime and recorded to `generated`; if a
/// stale value lived in `base` it would permanently shadow newly discovered
/// endpoints, so the merge explicitly skips them there.
const BASE_DENYLIST: &[&str] = &[
    "NAS_EW_GATEWAY_ADDR",
    "NAS_EW_GATEWAY_PORT",
    "HOMELAB_EW_GATEWAY_ADDR",
    "HOMELAB_EW_GATEWAY_PORT",
];

pub const DEFAULT_MESH_CHART_REPO: &str = "https://istio-release.storage.googleapis.com/charts";
pub const DEFAULT_MESH_VERSION: &str = "1.22.3";

/// Computes the merged env for `cluster`: start from `base`, overlay
/// `generated`, then overlay the small enumerated set of built-in defaults
/// (mesh chart repo URL, mesh version, per-cluster network name). `base`
/// entries for keys in `BASE_DENYLIST` are skipped so a freshly-discovered
/// `generated` value always wins.
pub fn merge(base: &EnvStore, generated: &EnvStore, cluster: ClusterId) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (k, v) in base.snapshot() {
        if BASE_DENYLIST.contains(&k.as_str()) {
            continue;
        }
        merged.insert(k, v);
    }
    for (k, v) in generated.snapshot() {
        merged.insert(k, v);
    }
    merged
        .entry("MESH_CHART_REPO".to_string())
        .or_insert_with(|| DEFAULT_MESH_CHART_REPO.to_string());
    merged
        .entry("MESH_VERSION".to_string())
        .or_insert_with(|| DEFAULT_MESH_VERSION.to_string());
    merged
        .entry(format!("{}_NETWORK", cluster.as_str().to_uppercase()))
        .or_insert_with(|| format!("network-{}", cluster.as_str()));
    merged
}

/// A mutex-guarded in-memory key=value map backed by a single file on disk.
/// `BTreeMap` keeps keys in sorted order for free, which is exactly the write
/// policy §4.2 requires (sorted, unique-keyed output).
pub struct EnvStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl EnvStore {
    /// Loads `path` if it exists; a missing file is an empty store, not an
    /// error (the `generated` file legitimately doesn't exist before the
    /// first run ever writes to it).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().unwrap().clone()
    }

    /// Sets `key` to `value`, persisting the change immediately. An empty
    /// `value` deletes the key instead of storing an empty string. Returns
    /// `true` iff the stored value changed (new key, removed key, or changed
    /// value) — callers use this to avoid redundant downstream writes.
    pub fn set(&self, key: &str, value: &str) -> Result<bool> {
        let changed = {
            let mut values = self.values.lock().unwrap();
            if value.is_empty() {
                values.remove(key).is_some()
            } else {
                match values.get(key) {
                    Some(existing) if existing == value => false,
                    _ => {
                        values.insert(key.to_string(), value.to_string());
                        true
                    }
                }
            }
        };
        if changed {
            self.write()?;
        }
        Ok(changed)
    }

    /// Applies every entry in `kv` and persists once the whole batch has been
    /// applied. Empty values delete their key, per the same rule as `set`.
    pub fn set_all(&self, kv: &BTreeMap<String, String>) -> Result<bool> {
        if kv.is_empty() {
            return Ok(false);
        }
        let mut any_changed = false;
        {
            let mut values = self.values.lock().unwrap();
            for (k, v) in kv {
                if v.is_empty() {
                    if values.remove(k).is_some() {
                        any_changed = true;
                    }
                } else if values.get(k) != Some(v) {
                    values.insert(k.clone(), v.clone());
                    any_changed = true;
                }
            }
        }
        if any_changed {
            self.write()?;
        }
        Ok(any_changed)
    }

    /// Sorted `KEY=VALUE\n` lines, atomic-replace-by-rename, mode 0600. When
    /// the map is empty the file is unlinked rather than left as an empty
    /// file, so a fully-drained generated store doesn't linger on disk.
    fn write(&self) -> Result<()> {
        let values = self.values.lock().unwrap();
        if values.is_empty() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
            set_mode(parent, 0o755)?;
        }

        let mut content = String::new();
        for (k, v) in values.iter() {
            content.push_str(k);
            content.push('=');
            content.push_str(v);
            content.push('\n');
        }

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, content)?;
        set_mode(&tmp_path, 0o600)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Parses the `KEY=VALUE` grammar: comment/blank lines ignored, surrounding
/// matched quotes stripped, whitespace trimmed, empty key or empty value
/// skipped (an explicit `KEY=` is represented as absence, not as an empty
/// string — consistent with `set`'s empty-value-deletes rule).
fn parse(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        map.insert(key.to_string(), value.to_string());
    }
    map
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_quotes_and_equals_in_values() {
        let input = "# comment\nA=1\n\nB=\"two\"\nC='3'\nEMPTY=\n=nokey\nD=has=equals\n";
        let map = parse(input);
        assert_eq!(map.get("A"), Some(&"1".to_string()));
        assert_eq!(map.get("B"), Some(&"two".to_string()));
        assert_eq!(map.get("C"), Some(&"3".to_string()));
        assert_eq!(map.get("D"), Some(&"has=equals".to_string()));
        assert!(!map.contains_key("EMPTY"));
        assert!(map.keys().all(|k| !k.is_empty()));
    }

    #[test]
    fn write_is_sorted_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env.generated");
        let store = EnvStore::load(&path).unwrap();
        store.set("Z", "1").unwrap();
        store.set("A", "2").unwrap();
        store.set("M", "3").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("A=2\nM=3\nZ=1\n"));

        let reloaded = EnvStore::load(&path).unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[test]
    fn emptying_the_store_unlinks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env.generated");
        let store = EnvStore::load(&path).unwrap();
        store.set("A", "1").unwrap();
        assert!(path.exists());
        store.set("A", "").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn merge_prefers_generated_over_base_for_denylisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let base = EnvStore::load(dir.path().join(".env")).unwrap();
        base.set("NAS_EW_GATEWAY_ADDR", "stale.example").unwrap();
        base.set("SOME_OTHER_KEY", "from-base").unwrap();
        let generated = EnvStore::load(dir.path().join(".env.generated")).unwrap();
        generated.set("NAS_EW_GATEWAY_ADDR", "fresh.example").unwrap();

        let merged = merge(&base, &generated, ClusterId::Nas);
        assert_eq!(merged.get("NAS_EW_GATEWAY_ADDR").unwrap(), "fresh.example");
        assert_eq!(merged.get("SOME_OTHER_KEY").unwrap(), "from-base");
        assert_eq!(merged.get("MESH_CHART_REPO").unwrap(), DEFAULT_MESH_CHART_REPO);
    }

    #[test]
    fn set_returns_false_when_value_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::load(dir.path().join(".env")).unwrap();
        assert!(store.set("A", "1").unwrap());
        assert!(!store.set("A", "1").unwrap());
        assert!(store.set("A", "2").unwrap());
    }
}
