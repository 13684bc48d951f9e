//! Backup rotation for catalog stores opened for writing

use std::io;
use std::path::{Path, PathBuf};

/// Default number of previous stores kept next to the live one
pub const DEFAULT_KEEP_BACKUPS: usize = 2;

/// Path of the `n`th backup of `store` (1 = newest).
///
/// `catalog.db` becomes `catalog.bak.db`, `catalog.bak2.db`, ...
pub fn backup_path(store: &Path, n: usize) -> PathBuf {
    let stem = store
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tag = if n <= 1 {
        "bak".to_string()
    } else {
        format!("bak{}", n)
    };
    let name = match store.extension() {
        Some(ext) => format!("{}.{}.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}.{}", stem, tag),
    };
    store.with_file_name(name)
}

/// Shift existing backups down by one and copy `store` into backup slot 1.
///
/// The live store stays in place so the next scan reconciles against it.
/// The oldest backup beyond `keep` is deleted. Returns `false` when there was
/// nothing to rotate (no store, or `keep == 0`).
pub fn rotate_backups(store: &Path, keep: usize) -> io::Result<bool> {
    if keep == 0 || !store.exists() {
        return Ok(false);
    }

    remove_if_exists(&backup_path(store, keep))?;
    for n in (1..keep).rev() {
        let from = backup_path(store, n);
        if from.exists() {
            std::fs::rename(&from, backup_path(store, n + 1))?;
        }
    }

    let newest = backup_path(store, 1);
    std::fs::copy(store, &newest)?;
    log::info!("Backed up {:?} to {:?}", store, newest);
    Ok(true)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_backup_path_naming() {
        let store = Path::new("/data/catalog.db");
        assert_eq!(backup_path(store, 1), PathBuf::from("/data/catalog.bak.db"));
        assert_eq!(backup_path(store, 2), PathBuf::from("/data/catalog.bak2.db"));
        assert_eq!(
            backup_path(Path::new("/data/catalog"), 3),
            PathBuf::from("/data/catalog.bak3")
        );
    }

    #[test]
    fn test_rotate_absent_store() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("catalog.db");
        assert!(!rotate_backups(&store, 2).unwrap());
        assert!(!backup_path(&store, 1).exists());
    }

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("catalog.db");

        fs::write(&store, "gen1").unwrap();
        assert!(rotate_backups(&store, 2).unwrap());
        fs::write(&store, "gen2").unwrap();
        rotate_backups(&store, 2).unwrap();
        fs::write(&store, "gen3").unwrap();
        rotate_backups(&store, 2).unwrap();

        assert_eq!(fs::read_to_string(&store).unwrap(), "gen3");
        assert_eq!(fs::read_to_string(backup_path(&store, 1)).unwrap(), "gen3");
        assert_eq!(fs::read_to_string(backup_path(&store, 2)).unwrap(), "gen2");
        assert!(!backup_path(&store, 3).exists());
    }

    #[test]
    fn test_rotate_keep_zero_keeps_no_backup() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("catalog.db");
        fs::write(&store, "old").unwrap();

        assert!(!rotate_backups(&store, 0).unwrap());
        assert_eq!(fs::read_to_string(&store).unwrap(), "old");
        assert!(!backup_path(&store, 1).exists());
    }
}
