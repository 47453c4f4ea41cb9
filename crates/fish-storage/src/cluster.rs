//! Persistence for the `Cluster` singleton: `SPEC_FULL.md` §6's
//! `<directory>/<node_name>/cluster.toml`, with a `.bak` sibling
//! written atomically on rename. Grounded on `convex-config`'s
//! versioned-file-manager idiom, simplified from JSON-versioned blobs
//! to a single toml document since this spec only ever needs the
//! latest cluster identity.

use std::fs;
use std::path::{Path, PathBuf};

use fish_traits::model::Cluster;

use crate::error::{StorageError, StorageResult};

/// Load-or-create the cluster identity file under `directory`.
pub fn load_or_create(directory: &Path) -> StorageResult<Cluster> {
    let path = cluster_path(directory);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let cluster: Cluster = toml::from_str(&contents)
                .map_err(|e| StorageError::Configuration(e.to_string()))?;
            Ok(cluster)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let cluster = Cluster::new();
            save(directory, &cluster)?;
            Ok(cluster)
        }
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Persist `cluster`, backing up the previous file and writing the
/// new one via a temp-file-then-rename so a crash mid-write never
/// leaves a half-written `cluster.toml`.
pub fn save(directory: &Path, cluster: &Cluster) -> StorageResult<()> {
    fs::create_dir_all(directory)?;
    let path = cluster_path(directory);
    let backup_path = backup_path(directory);
    let tmp_path = path.with_extension("toml.tmp");

    let contents =
        toml::to_string_pretty(cluster).map_err(|e| StorageError::Configuration(e.to_string()))?;
    fs::write(&tmp_path, contents)?;

    if path.exists() {
        fs::copy(&path, &backup_path)?;
    }
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

fn cluster_path(directory: &Path) -> PathBuf {
    directory.join("cluster.toml")
}

fn backup_path(directory: &Path) -> PathBuf {
    directory.join("cluster.toml.bak")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();
        assert_eq!(first.uid, second.uid);
    }

    #[test]
    fn save_writes_backup_of_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let first = Cluster::new();
        save(dir.path(), &first).unwrap();
        let mut second = first.clone();
        second.updated_at = fish_base::time::now();
        save(dir.path(), &second).unwrap();
        assert!(backup_path(dir.path()).exists());
        let reloaded = load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.uid, second.uid);
    }
}
