//! Scanner module - walks a directory tree and reconciles it into the catalog

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use walkdir::{DirEntry, WalkDir};

use crate::config::ScanConfig;
use crate::db::CatalogStore;
use crate::error::{ScanError, ScanErrorKind};
use crate::models::{now_millis, FileEntry, FileType, ScanResult, Volume};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::volume::VolumeResolver;

/// One directory level of the walk: the parent and volume context for its
/// children, and whether its stale children may be pruned on exit.
#[derive(Debug)]
struct Frame {
    path: PathBuf,
    depth: usize,
    entry_id: i64,
    volume_id: i64,
    prune: bool,
}

/// What the walker should do after an entry was handled
enum Visit {
    Descend,
    SkipSubtree,
}

/// Populates and reconciles the catalog for subtrees of the filesystem.
///
/// The scanner owns the store's write transaction for as long as it lives;
/// each [`DiskScanner::scan`] ends with a commit.
pub struct DiskScanner<'a> {
    store: &'a mut CatalogStore,
    resolver: &'a VolumeResolver,
    config: &'a ScanConfig,
    tracker: ProgressTracker,
    /// Volumes persisted during the current scan, by mount point
    volumes: HashMap<String, Volume>,
    scan_start: i64,
    first_volume_id: i64,
}

impl<'a> DiskScanner<'a> {
    /// Create a scanner writing into `store`
    pub fn new(
        store: &'a mut CatalogStore,
        resolver: &'a VolumeResolver,
        config: &'a ScanConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            config,
            tracker: new_tracker(config),
            volumes: HashMap::new(),
            scan_start: 0,
            first_volume_id: 0,
        }
    }

    /// Catalog the tree rooted at `start` and prune what no longer exists.
    ///
    /// Every ancestor of `start` is catalogued first so the subtree links back
    /// to a root entry. The returned result carries the entry for `start`.
    /// Failures on individual paths are collected in the result; store
    /// failures and failures to seed the ancestors abort the scan.
    pub fn scan(&mut self, start: &Path) -> Result<ScanResult, ScanError> {
        let started = Instant::now();
        let start = absolute_path(start)?;
        let mut result = ScanResult::new();

        self.tracker = new_tracker(self.config);
        self.volumes.clear();
        self.scan_start = match self.store.latest_last_seen()? {
            Some(latest) => now_millis().max(latest + 1),
            None => now_millis(),
        };
        self.tracker
            .reporter()
            .report_start(&start, self.config.max_depth);

        let (first_entry, first_volume) = self.seed_ancestors(&start, &mut result)?;
        self.first_volume_id = first_volume.id;
        log::debug!(
            "Start entry [{}] on volume {} ({})",
            first_entry.id,
            first_volume.id,
            first_volume.mount_point
        );

        if first_entry.is_dir() {
            self.walk(&start, &first_entry, &mut result)?;
        }

        self.tracker.record_done();
        self.store.commit()?;

        result.root = Some(first_entry);
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.tracker.reporter().report_done(&result);
        Ok(result)
    }

    /// Upsert every path from the filesystem root down to `start`, returning
    /// the entry for `start` and its volume
    fn seed_ancestors(
        &mut self,
        start: &Path,
        result: &mut ScanResult,
    ) -> Result<(FileEntry, Volume), ScanError> {
        let mut lineage: Vec<&Path> = start.ancestors().collect();
        lineage.reverse();

        let mut seeded: Option<(FileEntry, Volume)> = None;
        for dir in lineage {
            let metadata = std::fs::symlink_metadata(dir).map_err(|e| ScanError::from_io(dir, &e))?;
            let volume = self.volume_for(dir)?;
            let parent_id = seeded.as_ref().map_or(0, |(entry, _)| entry.id);
            let candidate = FileEntry::from_metadata(
                parent_id,
                volume.id,
                entry_name(dir),
                &metadata,
                self.seen_now(),
            );
            let entry = self.store.upsert_file_entry(&candidate)?;
            log::trace!("Seeded [{}] {:?}", entry.id, dir);
            result.count(&entry);
            seeded = Some((entry, volume));
        }

        seeded.ok_or_else(|| ScanError::invalid_path(start.to_path_buf(), "Path has no components"))
    }

    /// Depth-first walk below an already seeded directory
    fn walk(
        &mut self,
        start: &Path,
        first_entry: &FileEntry,
        result: &mut ScanResult,
    ) -> Result<(), ScanError> {
        if !self.config.allows_descent(0) {
            return Ok(());
        }
        let mut frames: Vec<Frame> = Vec::with_capacity(32);
        frames.push(Frame {
            path: start.to_path_buf(),
            depth: 0,
            entry_id: first_entry.id,
            volume_id: self.first_volume_id,
            prune: true,
        });

        let mut walker = WalkDir::new(start).follow_links(false).follow_root_links(false);
        if let Some(max_depth) = self.config.max_depth {
            walker = walker.max_depth(max_depth);
        }
        let mut it = walker.into_iter();

        while let Some(next) = it.next() {
            match next {
                Ok(dent) => {
                    // the start entry was handled by seeding
                    if dent.depth() == 0 {
                        continue;
                    }
                    while frames.last().is_some_and(|f| f.depth >= dent.depth()) {
                        if let Some(frame) = frames.pop() {
                            self.leave(frame, result)?;
                        }
                    }

                    let visit = self.visit(&dent, &mut frames, result)?;
                    if matches!(visit, Visit::SkipSubtree) && dent.file_type().is_dir() {
                        it.skip_current_dir();
                    }
                }
                Err(err) => self.walk_failed(err, &mut frames, result),
            }
        }

        while let Some(frame) = frames.pop() {
            self.leave(frame, result)?;
        }
        Ok(())
    }

    /// Catalog one walked entry below the current frame
    fn visit(
        &mut self,
        dent: &DirEntry,
        frames: &mut Vec<Frame>,
        result: &mut ScanResult,
    ) -> Result<Visit, ScanError> {
        let path = dent.path();
        let Some(parent) = frames.last() else {
            log::error!("No parent directory context for {:?}, should not happen", path);
            return Ok(Visit::SkipSubtree);
        };
        let (parent_id, parent_volume_id) = (parent.entry_id, parent.volume_id);
        let name = dent.file_name().to_string_lossy().into_owned();

        let metadata = match dent.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                return match err.io_error().map(|e| e.kind()) {
                    Some(ErrorKind::NotFound) => {
                        log::debug!("Vanished before stat: {:?}", path);
                        Ok(Visit::SkipSubtree)
                    }
                    Some(ErrorKind::PermissionDenied) => {
                        let file_type = FileType::classify(dent.file_type().into());
                        let candidate = FileEntry::placeholder(
                            parent_id,
                            parent_volume_id,
                            name,
                            file_type,
                            self.seen_now(),
                        );
                        let entry = self.store.upsert_file_entry(&candidate)?;
                        result.count(&entry);
                        result.placeholders += 1;
                        log::warn!("Permission denied: {:?}", path);
                        self.record_error(result, ScanError::permission_denied(path.to_path_buf()));
                        self.checkpoint(&entry, path)?;
                        Ok(Visit::SkipSubtree)
                    }
                    _ => {
                        log::error!("Unexpected error reading {:?}, should not happen: {}", path, err);
                        self.record_error(result, ScanError::from(err).with_path(path));
                        Ok(Visit::SkipSubtree)
                    }
                };
            }
        };

        let mut candidate =
            FileEntry::from_metadata(parent_id, parent_volume_id, name, &metadata, self.seen_now());

        if !candidate.is_dir() {
            let entry = self.store.upsert_file_entry(&candidate)?;
            result.count(&entry);
            self.checkpoint(&entry, path)?;
            return Ok(Visit::Descend);
        }

        let volume = match self.volume_for(path) {
            Ok(volume) => volume,
            Err(err) if err.kind == ScanErrorKind::MountNotFound => {
                log::error!("No mount contains {:?}, should not happen", path);
                self.record_error(result, err);
                return Ok(Visit::SkipSubtree);
            }
            Err(err) => return Err(err),
        };

        if volume.id != self.first_volume_id {
            let entry = self.store.upsert_file_entry(&candidate)?;
            result.count(&entry);
            result.skipped_mounts += 1;
            log::info!("Skipping mount point {:?} ({})", path, volume.file_system);
            self.checkpoint(&entry, path)?;
            return Ok(Visit::SkipSubtree);
        }

        candidate.volume_id = volume.id;
        let entry = self.store.upsert_file_entry(&candidate)?;
        result.count(&entry);
        self.checkpoint(&entry, path)?;

        if !self.config.allows_descent(dent.depth()) {
            return Ok(Visit::SkipSubtree);
        }
        frames.push(Frame {
            path: path.to_path_buf(),
            depth: dent.depth(),
            entry_id: entry.id,
            volume_id: volume.id,
            prune: true,
        });
        Ok(Visit::Descend)
    }

    /// Handle an error yielded by the walker itself
    fn walk_failed(&mut self, err: walkdir::Error, frames: &mut [Frame], result: &mut ScanResult) {
        let path = err.path().map(Path::to_path_buf);

        // a directory that could not be fully listed keeps its catalogued
        // children: its own listing failed, the listing broke off without a
        // path, or one of its children could not be read
        if let Some(frame) = frames.last_mut() {
            let listing_failed = path.as_ref().map_or(true, |p| *p == frame.path);
            if listing_failed || err.depth() > frame.depth {
                frame.prune = false;
            }
        }

        if err.loop_ancestor().is_some() {
            log::info!("Skipping filesystem loop at {:?}", path);
        } else {
            match err.io_error().map(|e| e.kind()) {
                Some(ErrorKind::PermissionDenied) => {
                    log::warn!("Cannot list {:?}: permission denied", path)
                }
                Some(ErrorKind::NotFound) => log::debug!("Vanished during walk: {:?}", path),
                _ => log::error!("Walk error at {:?}, should not happen: {}", path, err),
            }
        }
        self.record_error(result, ScanError::from(err));
    }

    /// Leave a directory, deleting children this scan did not confirm
    fn leave(&mut self, frame: Frame, result: &mut ScanResult) -> Result<(), ScanError> {
        if !frame.prune {
            log::debug!("Not pruning {:?}", frame.path);
            return Ok(());
        }

        let stale = self
            .store
            .get_children_not_seen_since(frame.entry_id, self.scan_start)?;
        for orphan in stale {
            let removed = self.store.delete_subtree(orphan.id)?;
            log::debug!(
                "Pruned {:?} ({} entries)",
                frame.path.join(&orphan.name),
                removed
            );
            result.pruned_entries += removed as u64;
        }
        Ok(())
    }

    /// Volume containing `path`, persisted once per mount point per scan
    fn volume_for(&mut self, path: &Path) -> Result<Volume, ScanError> {
        let mount_point = self
            .resolver
            .find_mount(path)
            .map(|m| m.mount_point.to_string_lossy().into_owned())
            .ok_or_else(|| ScanError::mount_not_found(path.to_path_buf()))?;
        if let Some(volume) = self.volumes.get(&mount_point) {
            return Ok(volume.clone());
        }

        let candidate = self.resolver.resolve(path, self.seen_now())?;
        let volume = self.store.upsert_volume(&candidate)?;
        log::debug!(
            "Volume {} at {} ({}, {})",
            volume.id,
            volume.mount_point,
            volume.device,
            volume.file_system
        );
        self.volumes.insert(mount_point, volume.clone());
        Ok(volume)
    }

    fn checkpoint(&mut self, entry: &FileEntry, path: &Path) -> Result<(), ScanError> {
        if self.tracker.record_progress(entry, path) {
            self.store.commit()?;
            log::trace!("Checkpoint after [{}]", entry.id);
        }
        Ok(())
    }

    fn record_error(&self, result: &mut ScanResult, error: ScanError) {
        self.tracker.reporter().report_error(&error);
        result.errors.push(error);
    }

    /// Timestamp for entries confirmed now; never before the scan start
    fn seen_now(&self) -> i64 {
        now_millis().max(self.scan_start)
    }
}

/// Open the configured store, scan every root in order, then close it.
///
/// A root that cannot be seeded (missing, unreadable) yields a result with
/// no root entry and the error recorded; store failures abort all roots.
pub fn scan_roots(config: &ScanConfig) -> Result<Vec<ScanResult>, ScanError> {
    let mut store = CatalogStore::open_for_writing(&config.db_path, config.keep_backups)?;
    let resolver = VolumeResolver::from_system()?;
    let mut results = Vec::with_capacity(config.roots.len());

    {
        let mut scanner = DiskScanner::new(&mut store, &resolver, config);
        for root in &config.roots {
            match scanner.scan(root) {
                Ok(result) => results.push(result),
                Err(err) if is_root_failure(&err) => {
                    log::error!("Cannot scan {:?}: {}", root, err);
                    let mut result = ScanResult::new();
                    result.errors.push(err);
                    results.push(result);
                }
                Err(err) => return Err(err),
            }
        }
    }

    store.close()?;
    Ok(results)
}

fn is_root_failure(err: &ScanError) -> bool {
    matches!(
        err.kind,
        ScanErrorKind::NotFound
            | ScanErrorKind::PermissionDenied
            | ScanErrorKind::InvalidPath
            | ScanErrorKind::MountNotFound
    )
}

fn new_tracker(config: &ScanConfig) -> ProgressTracker {
    ProgressTracker::new(
        ProgressReporter::new(config.show_progress, config.json_progress),
        config.checkpoint_interval_ms,
    )
}

/// Make `path` absolute and drop `.`/`..` components lexically
fn absolute_path(path: &Path) -> Result<PathBuf, ScanError> {
    let absolute = std::path::absolute(path).map_err(|e| {
        ScanError::invalid_path(path.to_path_buf(), format!("Cannot make absolute: {}", e))
    })?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// Catalog name of a path segment; a filesystem root is named by its path
fn entry_name(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => path.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MountEntry;
    use std::fs;
    use tempfile::TempDir;

    fn resolver(extra_mounts: &[&Path]) -> VolumeResolver {
        let mut mounts = vec![MountEntry::new("/", "/dev/root", "ext4", 4096)];
        for mount in extra_mounts {
            mounts.push(MountEntry::new(*mount, "/dev/usb", "vfat", 512));
        }
        VolumeResolver::new(mounts)
    }

    fn quiet() -> ScanConfig {
        ScanConfig::builder().show_progress(false).build()
    }

    /// tree/a.txt (10 bytes), tree/b/c.txt (5 bytes)
    fn build_tree(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a.txt"), "0123456789").unwrap();
        fs::write(root.join("b").join("c.txt"), "hello").unwrap();
        root
    }

    fn run(
        store: &mut CatalogStore,
        resolver: &VolumeResolver,
        config: &ScanConfig,
        path: &Path,
    ) -> ScanResult {
        DiskScanner::new(store, resolver, config).scan(path).unwrap()
    }

    fn child(store: &CatalogStore, parent_id: i64, name: &str) -> Option<FileEntry> {
        store.get_by_parent_and_name(parent_id, name).unwrap()
    }

    /// (id, parent_id, name, first_seen) of every entry under `id`, depth-first
    fn snapshot(store: &CatalogStore, id: i64, out: &mut Vec<(i64, i64, String, i64)>) {
        for entry in store.get_children(id).unwrap() {
            out.push((
                entry.id,
                entry.parent_id,
                entry.name.clone(),
                entry.first_seen_timestamp,
            ));
            snapshot(store, entry.id, out);
        }
    }

    #[test]
    fn test_fresh_scan_catalogs_tree() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let result = run(&mut store, &resolver, &quiet(), &root);
        let top = result.root.clone().unwrap();
        assert_eq!(top.name, "tree");
        assert_eq!(top.file_type, FileType::Directory);
        assert_eq!(result.total_files, 2);
        assert!(result.is_success());

        let a = child(&store, top.id, "a.txt").unwrap();
        assert_eq!(a.file_type, FileType::RegularFile);
        assert_eq!(a.size, 10);
        assert_eq!(a.volume_id, top.volume_id);

        let b = child(&store, top.id, "b").unwrap();
        let c = child(&store, b.id, "c.txt").unwrap();
        assert_eq!(c.size, 5);
        assert_eq!(
            store.full_path(&c).unwrap(),
            root.join("b").join("c.txt").to_string_lossy()
        );

        // ancestors link back to a single filesystem root
        let roots = store.get_children(0).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "/");
        assert_eq!(store.volumes().unwrap().len(), 1);
    }

    #[test]
    fn test_rescan_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let first = run(&mut store, &resolver, &quiet(), &root);
        let top = first.root.unwrap();
        let before = child(&store, top.id, "a.txt").unwrap();

        fs::write(root.join("a.txt"), "0123456789abcdefghij").unwrap();
        let second = run(&mut store, &resolver, &quiet(), &root);
        assert_eq!(second.root.unwrap().id, top.id);

        let after = child(&store, top.id, "a.txt").unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.first_seen_timestamp, before.first_seen_timestamp);
        assert_eq!(after.size, 20);
        assert!(after.last_seen_timestamp > before.last_seen_timestamp);
        assert_eq!(second.pruned_entries, 0);
    }

    #[test]
    fn test_deletion_propagates() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let top = run(&mut store, &resolver, &quiet(), &root).root.unwrap();
        let count_before = store.entry_count().unwrap();

        fs::remove_dir_all(root.join("b")).unwrap();
        let result = run(&mut store, &resolver, &quiet(), &root);

        assert_eq!(result.pruned_entries, 2);
        assert!(child(&store, top.id, "b").is_none());
        assert!(store
            .find_by_name_and_type("c.txt", FileType::RegularFile)
            .unwrap()
            .is_empty());
        assert!(child(&store, top.id, "a.txt").is_some());
        assert_eq!(store.entry_count().unwrap(), count_before - 2);
    }

    #[test]
    fn test_moved_subtree_is_recreated_under_new_name() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let top = run(&mut store, &resolver, &quiet(), &root).root.unwrap();
        fs::rename(root.join("b"), root.join("d")).unwrap();
        run(&mut store, &resolver, &quiet(), &root);

        assert!(child(&store, top.id, "b").is_none());
        let d = child(&store, top.id, "d").unwrap();
        assert!(child(&store, d.id, "c.txt").is_some());
        assert_eq!(
            store
                .find_by_name_and_type("c.txt", FileType::RegularFile)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_unchanged_rescan_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        run(&mut store, &resolver, &quiet(), &root);
        let mut first = Vec::new();
        snapshot(&store, 0, &mut first);
        let first_seen = store.latest_last_seen().unwrap().unwrap();

        let result = run(&mut store, &resolver, &quiet(), &root);
        let mut second = Vec::new();
        snapshot(&store, 0, &mut second);

        assert_eq!(first, second);
        assert_eq!(result.pruned_entries, 0);
        assert!(store.latest_last_seen().unwrap().unwrap() > first_seen);
    }

    #[test]
    fn test_mount_boundary_is_catalogued_but_not_entered() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mount = root.join("mnt");
        fs::create_dir(&mount).unwrap();
        fs::write(mount.join("inner.txt"), "x").unwrap();

        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[mount.as_path()]);
        let result = run(&mut store, &resolver, &quiet(), &root);
        let top = result.root.clone().unwrap();

        let mnt = child(&store, top.id, "mnt").unwrap();
        assert_eq!(mnt.file_type, FileType::Directory);
        assert_eq!(store.child_count(mnt.id).unwrap(), 0);
        assert_eq!(result.skipped_mounts, 1);
        assert!(store
            .find_by_name_and_type("inner.txt", FileType::RegularFile)
            .unwrap()
            .is_empty());
        assert!(store.get_volume_by_mount_point(&mount.to_string_lossy()).unwrap().is_some());

        // rescanning keeps the boundary directory
        run(&mut store, &resolver, &quiet(), &root);
        assert!(child(&store, top.id, "mnt").is_some());
    }

    #[test]
    fn test_max_depth_limits_descent() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let shallow = ScanConfig::builder()
            .show_progress(false)
            .max_depth(Some(1))
            .build();
        let top = run(&mut store, &resolver, &shallow, &root).root.unwrap();
        let b = child(&store, top.id, "b").unwrap();
        assert!(child(&store, top.id, "a.txt").is_some());
        assert_eq!(store.child_count(b.id).unwrap(), 0);

        let root_only = ScanConfig::builder()
            .show_progress(false)
            .max_depth(Some(0))
            .build();
        let mut other = CatalogStore::open_memory().unwrap();
        let top = run(&mut other, &resolver, &root_only, &root).root.unwrap();
        assert_eq!(other.child_count(top.id).unwrap(), 0);
    }

    #[test]
    fn test_directory_at_max_depth_is_not_pruned() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let top = run(&mut store, &resolver, &quiet(), &root).root.unwrap();
        let shallow = ScanConfig::builder()
            .show_progress(false)
            .max_depth(Some(1))
            .build();
        let result = run(&mut store, &resolver, &shallow, &root);

        let b = child(&store, top.id, "b").unwrap();
        assert!(child(&store, b.id, "c.txt").is_some());
        assert_eq!(result.pruned_entries, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_catalogued_not_followed() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        std::os::unix::fs::symlink(root.join("b"), root.join("link")).unwrap();
        std::os::unix::fs::symlink(&root, root.join("b").join("loop")).unwrap();

        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);
        let result = run(&mut store, &resolver, &quiet(), &root);
        let top = result.root.clone().unwrap();

        let link = child(&store, top.id, "link").unwrap();
        assert_eq!(link.file_type, FileType::Symlink);
        assert_eq!(store.child_count(link.id).unwrap(), 0);
        assert_eq!(result.total_symlinks, 2);
        assert_eq!(
            store
                .find_by_name_and_type("c.txt", FileType::RegularFile)
                .unwrap()
                .len(),
            1
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_entry_gets_placeholder() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let locked = root.join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.bin"), "0123456789").unwrap();
        // listable but not searchable: names are visible, stat fails
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o600)).unwrap();

        if fs::symlink_metadata(locked.join("secret.bin")).is_ok() {
            // privileged runner, permissions are not enforced
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);
        let result = run(&mut store, &resolver, &quiet(), &root);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let top = result.root.clone().unwrap();
        let locked_entry = child(&store, top.id, "locked").unwrap();
        let secret = child(&store, locked_entry.id, "secret.bin").unwrap();
        assert_eq!(secret.file_type, FileType::RegularFile);
        assert_eq!(secret.size, 0);
        assert_eq!(secret.modification_timestamp, 0);
        assert_eq!(secret.volume_id, locked_entry.volume_id);
        assert_eq!(result.placeholders, 1);
        assert!(result
            .errors
            .iter()
            .any(|e| e.kind == ScanErrorKind::PermissionDenied));
    }

    #[cfg(unix)]
    #[test]
    fn test_unlistable_directory_keeps_children() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);
        let top = run(&mut store, &resolver, &quiet(), &root).root.unwrap();

        let b_path = root.join("b");
        fs::set_permissions(&b_path, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&b_path).is_ok() {
            fs::set_permissions(&b_path, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = run(&mut store, &resolver, &quiet(), &root);
        fs::set_permissions(&b_path, fs::Permissions::from_mode(0o755)).unwrap();

        let b = child(&store, top.id, "b").unwrap();
        assert!(child(&store, b.id, "c.txt").is_some());
        assert_eq!(result.pruned_entries, 0);
        assert!(!result.is_success());
    }

    #[test]
    fn test_file_as_start_path() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);

        let result = run(&mut store, &resolver, &quiet(), &root.join("a.txt"));
        let file = result.root.clone().unwrap();
        assert_eq!(file.name, "a.txt");
        assert_eq!(file.file_type, FileType::RegularFile);
        assert_eq!(file.size, 10);
        assert_eq!(store.child_count(file.id).unwrap(), 0);

        let parent = store.get_by_id(file.parent_id).unwrap().unwrap();
        assert_eq!(parent.name, "tree");
        assert_eq!(result.total_files, 1);
    }

    #[test]
    fn test_missing_start_path_fails() {
        let dir = TempDir::new().unwrap();
        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);
        let config = quiet();

        let err = DiskScanner::new(&mut store, &resolver, &config)
            .scan(&dir.path().join("absent"))
            .unwrap_err();
        assert_eq!(err.kind, ScanErrorKind::NotFound);
    }

    /// Seed and walk `root` into a file store, then drop it without the final commit
    fn interrupted_scan(db_path: &Path, root: &Path, checkpoint_interval_ms: u64) {
        let resolver = resolver(&[]);
        let config = ScanConfig::builder()
            .show_progress(false)
            .checkpoint_interval_ms(checkpoint_interval_ms)
            .build();
        let mut store = CatalogStore::open(db_path).unwrap();
        let mut scanner = DiskScanner::new(&mut store, &resolver, &config);
        scanner.scan_start = now_millis();

        let mut result = ScanResult::new();
        let (first_entry, first_volume) = scanner.seed_ancestors(root, &mut result).unwrap();
        scanner.first_volume_id = first_volume.id;
        scanner.walk(root, &first_entry, &mut result).unwrap();
        assert_eq!(result.total_files, 2);
    }

    #[test]
    fn test_checkpoints_survive_an_interrupted_scan() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);

        let checkpointed = dir.path().join("checkpointed.db");
        interrupted_scan(&checkpointed, &root, 0);
        let store = CatalogStore::open_read_only(&checkpointed).unwrap();
        for name in ["a.txt", "c.txt"] {
            assert_eq!(
                store
                    .find_by_name_and_type(name, FileType::RegularFile)
                    .unwrap()
                    .len(),
                1
            );
        }
        assert!(store.lookup_path(&root.join("b")).unwrap().is_some());

        // no checkpoint was due, so nothing survives the dropped transaction
        let uncommitted = dir.path().join("uncommitted.db");
        interrupted_scan(&uncommitted, &root, 60_000);
        let store = CatalogStore::open_read_only(&uncommitted).unwrap();
        assert_eq!(store.entry_count().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_walk_error_suspends_pruning() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        std::os::unix::fs::symlink(&root, root.join("b").join("loop")).unwrap();
        // a followed link back to the root yields an error for a child of b
        let err = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .find_map(|e| e.err())
            .unwrap();
        assert!(err.loop_ancestor().is_some());
        assert!(err.depth() > 1);

        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);
        let config = quiet();
        let mut scanner = DiskScanner::new(&mut store, &resolver, &config);
        let mut frames = vec![
            Frame {
                path: root.clone(),
                depth: 0,
                entry_id: 1,
                volume_id: 1,
                prune: true,
            },
            Frame {
                path: root.join("b"),
                depth: 1,
                entry_id: 2,
                volume_id: 1,
                prune: true,
            },
        ];
        let mut result = ScanResult::new();
        scanner.walk_failed(err, &mut frames, &mut result);

        assert!(frames[0].prune);
        assert!(!frames[1].prune);
        assert_eq!(result.error_count(), 1);
    }

    #[test]
    fn test_out_of_range_timestamp_does_not_abort_scan() {
        use std::time::{Duration, UNIX_EPOCH};

        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let odd = root.join("odd.bin");
        fs::write(&odd, "x").unwrap();
        let far_future = UNIX_EPOCH + Duration::from_secs(1 << 60);
        let file = fs::File::options().write(true).open(&odd).unwrap();
        if file.set_modified(far_future).is_err() {
            // filesystem cannot store the timestamp
            return;
        }
        drop(file);

        let mut store = CatalogStore::open_memory().unwrap();
        let resolver = resolver(&[]);
        let result = run(&mut store, &resolver, &quiet(), &root);

        let entry = child(&store, result.root.unwrap().id, "odd.bin").unwrap();
        assert_eq!(entry.size, 1);
        assert!(entry.modification_timestamp > 0);
        assert_eq!(result.total_files, 3);
    }

    #[test]
    fn test_scan_roots_persists_catalog() {
        let dir = TempDir::new().unwrap();
        let root = build_tree(&dir);
        let db_path = dir.path().join("catalog.db");
        let config = ScanConfig::builder()
            .add_root(root.clone())
            .add_root(dir.path().join("absent"))
            .db_path(db_path.clone())
            .show_progress(false)
            .build();

        let results = scan_roots(&config).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].root.as_ref().unwrap().name, "tree");
        assert!(results[1].root.is_none());
        assert_eq!(results[1].errors[0].kind, ScanErrorKind::NotFound);

        let store = CatalogStore::open_read_only(&db_path).unwrap();
        assert_eq!(
            store
                .find_by_name_and_type("c.txt", FileType::RegularFile)
                .unwrap()
                .len(),
            1
        );

        // second run keeps the catalog and backs up the first
        scan_roots(&config).unwrap();
        assert!(crate::backup::backup_path(&db_path, 1).exists());
        let store = CatalogStore::open_read_only(&db_path).unwrap();
        assert_eq!(
            store
                .find_by_name_and_type("a.txt", FileType::RegularFile)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_absolute_path_normalizes() {
        let path = absolute_path(Path::new("/a/./b/../c")).unwrap();
        assert_eq!(path, PathBuf::from("/a/c"));
        assert_eq!(entry_name(Path::new("/")), "/");
        assert_eq!(entry_name(Path::new("/a/c")), "c");
    }
}
