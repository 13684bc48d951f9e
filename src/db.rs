//! Catalog store: persistent Volume / FileType / FileEntry tables

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Params, Result as SqliteResult, Row};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::backup;
use crate::error::{ScanError, ScanErrorKind};
use crate::models::{FileEntry, FileType, Volume};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

macro_rules! select_entry {
    ($tail:literal) => {
        concat!(
            "SELECT id, parentID, name, volumeID, fileTypeID, size, creationTimestamp, \
             modificationTimestamp, accessTimestamp, firstSeenTimestamp, lastSeenTimestamp \
             FROM FileEntry ",
            $tail
        )
    };
}

macro_rules! select_volume {
    ($tail:literal) => {
        concat!(
            "SELECT id, mountPoint, device, fileSystem, blockSize, firstSeenTimestamp, \
             lastSeenTimestamp FROM Volume ",
            $tail
        )
    };
}

/// Handle to a catalog database.
///
/// Writable handles keep one transaction open at all times; nothing is
/// durable until [`CatalogStore::commit`]. Dropping a handle rolls back
/// whatever was not committed.
pub struct CatalogStore {
    conn: Connection,
    writable: bool,
}

impl CatalogStore {
    /// Back up any existing store, then open it for writing
    pub fn open_for_writing(path: &Path, keep_backups: usize) -> Result<Self, ScanError> {
        backup::rotate_backups(path, keep_backups).map_err(|e| ScanError::from_io(path, &e))?;
        log::info!("Opening catalog {:?}", path);
        Self::open(path).map_err(|e| ScanError::from(e).with_path(path))
    }

    /// Open or create a writable store in place
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::init(Connection::open(path)?, true)
    }

    /// Open an existing store for queries only
    pub fn open_read_only(path: &Path) -> Result<Self, ScanError> {
        if !path.exists() {
            return Err(ScanError::not_found(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| ScanError::from(e).with_path(path))?;
        Ok(Self::init(conn, false)?)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?, true)
    }

    fn init(conn: Connection, writable: bool) -> SqliteResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        install_regexp(&conn)?;

        let store = Self { conn, writable };
        if writable {
            store.init_schema()?;
            store.conn.execute_batch("BEGIN")?;
        }
        Ok(store)
    }

    /// Initialize database schema and seed the file types
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS Volume (
                id                 INTEGER PRIMARY KEY,
                mountPoint         TEXT    NOT NULL UNIQUE CHECK(LENGTH(mountPoint) > 0),
                device             TEXT    NOT NULL CHECK(LENGTH(device) > 0),
                fileSystem         TEXT    NOT NULL CHECK(LENGTH(fileSystem) > 0),
                blockSize          INTEGER NOT NULL
                                   CHECK(blockSize > 0 AND (blockSize & (blockSize - 1)) = 0),
                firstSeenTimestamp INTEGER NOT NULL,
                lastSeenTimestamp  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS FileType (
                id   INTEGER PRIMARY KEY,
                name TEXT    NOT NULL UNIQUE CHECK(LENGTH(name) > 0)
            );

            CREATE TABLE IF NOT EXISTS FileEntry (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                parentID              INTEGER CHECK(parentID > 0) REFERENCES FileEntry(id),
                name                  TEXT    NOT NULL CHECK(LENGTH(name) > 0),
                volumeID              INTEGER NOT NULL REFERENCES Volume(id),
                fileTypeID            INTEGER NOT NULL REFERENCES FileType(id),
                size                  INTEGER NOT NULL CHECK(size >= 0),
                creationTimestamp     INTEGER NOT NULL,
                modificationTimestamp INTEGER NOT NULL,
                accessTimestamp       INTEGER NOT NULL,
                firstSeenTimestamp    INTEGER NOT NULL,
                lastSeenTimestamp     INTEGER NOT NULL,
                CONSTRAINT pn UNIQUE (parentID, name)
            );
            CREATE INDEX IF NOT EXISTS idx_entry_parent_seen ON FileEntry(parentID, lastSeenTimestamp);
            CREATE INDEX IF NOT EXISTS idx_entry_name ON FileEntry(name);
            CREATE INDEX IF NOT EXISTS idx_entry_volume ON FileEntry(volumeID);
            CREATE INDEX IF NOT EXISTS idx_entry_type_size ON FileEntry(fileTypeID, size);
            ",
        )?;

        let mut stmt = self
            .conn
            .prepare("INSERT OR REPLACE INTO FileType (id, name) VALUES (?1, ?2)")?;
        for file_type in FileType::ALL {
            stmt.execute(params![file_type.id(), file_type.as_str()])?;
        }
        Ok(())
    }

    /// Whether this handle may write
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Durably persist everything since the previous commit
    pub fn commit(&mut self) -> SqliteResult<()> {
        if !self.writable {
            return Ok(());
        }
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Close the handle, discarding uncommitted changes
    pub fn close(self) -> SqliteResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        self.conn.close().map_err(|(_, e)| e)
    }

    /// Insert a volume if its mount point is unknown, else refresh the stored row.
    ///
    /// The stored id and first-seen timestamp are preserved on update.
    pub fn upsert_volume(&mut self, volume: &Volume) -> SqliteResult<Volume> {
        let existing = self.get_volume_by_mount_point(&volume.mount_point)?;

        match existing {
            Some(existing) => {
                self.conn
                    .prepare_cached(
                        "UPDATE Volume SET device = ?2, fileSystem = ?3, blockSize = ?4, \
                         lastSeenTimestamp = ?5 WHERE id = ?1",
                    )?
                    .execute(params![
                        existing.id,
                        volume.device,
                        volume.file_system,
                        volume.block_size,
                        volume.last_seen_timestamp,
                    ])?;
                Ok(Volume {
                    id: existing.id,
                    first_seen_timestamp: existing.first_seen_timestamp,
                    ..volume.clone()
                })
            }
            None => {
                self.conn
                    .prepare_cached(
                        "INSERT INTO Volume (mountPoint, device, fileSystem, blockSize, \
                         firstSeenTimestamp, lastSeenTimestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?
                    .execute(params![
                        volume.mount_point,
                        volume.device,
                        volume.file_system,
                        volume.block_size,
                        volume.first_seen_timestamp,
                        volume.last_seen_timestamp,
                    ])?;
                Ok(Volume {
                    id: self.conn.last_insert_rowid(),
                    ..volume.clone()
                })
            }
        }
    }

    /// Insert an entry if (parent, name) is unknown, else update the existing row.
    ///
    /// On update the original id and first-seen timestamp are kept and every
    /// other field, including last-seen, takes the candidate's value.
    pub fn upsert_file_entry(&mut self, entry: &FileEntry) -> SqliteResult<FileEntry> {
        let existing: Option<(i64, i64)> = self
            .conn
            .prepare_cached(
                "SELECT id, firstSeenTimestamp FROM FileEntry WHERE parentID IS ?1 AND name = ?2",
            )?
            .query_row(params![parent_param(entry.parent_id), entry.name], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        match existing {
            Some((id, first_seen_timestamp)) => {
                self.conn
                    .prepare_cached(
                        "UPDATE FileEntry SET volumeID = ?2, fileTypeID = ?3, size = ?4, \
                         creationTimestamp = ?5, modificationTimestamp = ?6, accessTimestamp = ?7, \
                         lastSeenTimestamp = ?8 WHERE id = ?1",
                    )?
                    .execute(params![
                        id,
                        entry.volume_id,
                        entry.file_type.id(),
                        size_param(entry.size),
                        entry.creation_timestamp,
                        entry.modification_timestamp,
                        entry.access_timestamp,
                        entry.last_seen_timestamp,
                    ])?;
                Ok(FileEntry {
                    id,
                    first_seen_timestamp,
                    ..entry.clone()
                })
            }
            None => {
                self.conn
                    .prepare_cached(
                        "INSERT INTO FileEntry (parentID, name, volumeID, fileTypeID, size, \
                         creationTimestamp, modificationTimestamp, accessTimestamp, \
                         firstSeenTimestamp, lastSeenTimestamp) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )?
                    .execute(params![
                        parent_param(entry.parent_id),
                        entry.name,
                        entry.volume_id,
                        entry.file_type.id(),
                        size_param(entry.size),
                        entry.creation_timestamp,
                        entry.modification_timestamp,
                        entry.access_timestamp,
                        entry.first_seen_timestamp,
                        entry.last_seen_timestamp,
                    ])?;
                Ok(FileEntry {
                    id: self.conn.last_insert_rowid(),
                    ..entry.clone()
                })
            }
        }
    }

    /// Direct children whose last-seen timestamp is strictly before `timestamp`
    pub fn get_children_not_seen_since(
        &self,
        parent_id: i64,
        timestamp: i64,
    ) -> SqliteResult<Vec<FileEntry>> {
        self.query_entries(
            select_entry!("WHERE parentID IS ?1 AND lastSeenTimestamp < ?2 ORDER BY name"),
            params![parent_param(parent_id), timestamp],
        )
    }

    /// Remove an entry and all its descendants, returning the number of rows removed
    pub fn delete_subtree(&mut self, entry_id: i64) -> SqliteResult<usize> {
        self.conn
            .prepare_cached(
                "WITH RECURSIVE subtree(id) AS ( \
                     SELECT ?1 \
                     UNION \
                     SELECT f.id FROM FileEntry f JOIN subtree s ON f.parentID = s.id \
                 ) \
                 DELETE FROM FileEntry WHERE id IN (SELECT id FROM subtree)",
            )?
            .execute(params![entry_id])
    }

    /// Get a volume by id
    pub fn get_volume_by_id(&self, id: i64) -> SqliteResult<Option<Volume>> {
        self.conn
            .prepare_cached(select_volume!("WHERE id = ?1"))?
            .query_row(params![id], volume_from_row)
            .optional()
    }

    /// Get a volume by mount point
    pub fn get_volume_by_mount_point(&self, mount_point: &str) -> SqliteResult<Option<Volume>> {
        self.conn
            .prepare_cached(select_volume!("WHERE mountPoint = ?1"))?
            .query_row(params![mount_point], volume_from_row)
            .optional()
    }

    /// All known volumes, ordered by mount point
    pub fn volumes(&self) -> SqliteResult<Vec<Volume>> {
        let mut stmt = self.conn.prepare_cached(select_volume!("ORDER BY mountPoint"))?;
        let rows = stmt.query_map([], volume_from_row)?;
        rows.collect()
    }

    /// The seeded FileType rows as (id, name)
    pub fn file_type_rows(&self) -> SqliteResult<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, name FROM FileType ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Get an entry by id
    pub fn get_by_id(&self, id: i64) -> SqliteResult<Option<FileEntry>> {
        self.conn
            .prepare_cached(select_entry!("WHERE id = ?1"))?
            .query_row(params![id], entry_from_row)
            .optional()
    }

    /// Direct children of an entry ordered by name; `0` lists root entries
    pub fn get_children(&self, parent_id: i64) -> SqliteResult<Vec<FileEntry>> {
        self.query_entries(
            select_entry!("WHERE parentID IS ?1 ORDER BY name"),
            params![parent_param(parent_id)],
        )
    }

    /// Number of direct children of an entry
    pub fn child_count(&self, parent_id: i64) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM FileEntry WHERE parentID IS ?1")?
            .query_row(params![parent_param(parent_id)], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Get the child of `parent_id` called `name`
    pub fn get_by_parent_and_name(
        &self,
        parent_id: i64,
        name: &str,
    ) -> SqliteResult<Option<FileEntry>> {
        self.conn
            .prepare_cached(select_entry!("WHERE parentID IS ?1 AND name = ?2"))?
            .query_row(params![parent_param(parent_id), name], entry_from_row)
            .optional()
    }

    /// All entries with the given name and type
    pub fn find_by_name_and_type(
        &self,
        name: &str,
        file_type: FileType,
    ) -> SqliteResult<Vec<FileEntry>> {
        self.query_entries(
            select_entry!("WHERE name = ?1 AND fileTypeID = ?2"),
            params![name, file_type.id()],
        )
    }

    /// All entries with the given name, type and size
    pub fn find_by_name_type_size(
        &self,
        name: &str,
        file_type: FileType,
        size: u64,
    ) -> SqliteResult<Vec<FileEntry>> {
        self.query_entries(
            select_entry!("WHERE name = ?1 AND fileTypeID = ?2 AND size = ?3"),
            params![name, file_type.id(), size_param(size)],
        )
    }

    /// All entries with the given type and size
    pub fn find_by_type_and_size(
        &self,
        file_type: FileType,
        size: u64,
    ) -> SqliteResult<Vec<FileEntry>> {
        self.query_entries(
            select_entry!("WHERE fileTypeID = ?1 AND size = ?2"),
            params![file_type.id(), size_param(size)],
        )
    }

    /// Any one entry on the given volume
    pub fn first_by_volume(&self, volume_id: i64) -> SqliteResult<Option<FileEntry>> {
        self.conn
            .prepare_cached(select_entry!("WHERE volumeID = ?1 ORDER BY id LIMIT 1"))?
            .query_row(params![volume_id], entry_from_row)
            .optional()
    }

    /// Follow an absolute path from its root entry down, one name at a time
    pub fn lookup_path(&self, path: &Path) -> SqliteResult<Option<FileEntry>> {
        let mut current: Option<FileEntry> = None;
        for component in path.components() {
            let name = match component {
                Component::RootDir | Component::Prefix(_) if current.is_none() => {
                    // the root entry carries the whole root path as its name
                    let root: PathBuf = path
                        .components()
                        .take_while(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
                        .collect();
                    root.to_string_lossy().into_owned()
                }
                Component::RootDir | Component::Prefix(_) => continue,
                Component::CurDir => continue,
                Component::ParentDir => return Ok(None),
                Component::Normal(name) => name.to_string_lossy().into_owned(),
            };
            let parent_id = current.as_ref().map_or(0, |e| e.id);
            match self.get_by_parent_and_name(parent_id, &name)? {
                Some(entry) => current = Some(entry),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Entries whose lowercased name matches `pattern`
    pub fn find_by_name_regex(&self, pattern: &str) -> Result<Vec<FileEntry>, ScanError> {
        if let Err(e) = Regex::new(pattern) {
            return Err(ScanError::new(
                ScanErrorKind::InvalidPattern,
                None,
                e.to_string(),
            ));
        }
        Ok(self.query_entries(
            select_entry!("WHERE name REGEXP ?1 ORDER BY id"),
            params![pattern],
        )?)
    }

    /// Reconstruct the absolute path of an entry from its parent chain.
    ///
    /// A missing ancestor is rendered as `<null>/`.
    pub fn full_path(&self, entry: &FileEntry) -> SqliteResult<String> {
        let mut names = vec![entry.name.clone()];
        let mut parent_id = entry.parent_id;
        let mut broken = false;

        while parent_id > 0 {
            match self.get_by_id(parent_id)? {
                Some(parent) => {
                    parent_id = parent.parent_id;
                    names.push(parent.name);
                }
                None => {
                    broken = true;
                    break;
                }
            }
        }

        let mut path = if broken {
            "<null>/".to_string()
        } else {
            String::new()
        };
        for name in names.iter().rev() {
            if !path.is_empty() && !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(name);
        }
        Ok(path)
    }

    /// Get entry count
    pub fn entry_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM FileEntry", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Most recent last-seen timestamp of any entry
    pub fn latest_last_seen(&self) -> SqliteResult<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(lastSeenTimestamp) FROM FileEntry", [], |row| {
                row.get(0)
            })
    }

    fn query_entries<P: Params>(&self, sql: &str, params: P) -> SqliteResult<Vec<FileEntry>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, entry_from_row)?;
        rows.collect()
    }
}

/// Register `REGEXP` so `name REGEXP ?` works; values are lowercased before matching
fn install_regexp(conn: &Connection) -> SqliteResult<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let value = ctx.get_raw(1).as_str().unwrap_or("").to_lowercase();
            Ok(pattern.is_match(&value))
        },
    )
}

/// Parent id 0 is stored as NULL so the self-reference holds for roots
fn parent_param(parent_id: i64) -> Option<i64> {
    (parent_id != 0).then_some(parent_id)
}

fn size_param(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn entry_from_row(row: &Row<'_>) -> SqliteResult<FileEntry> {
    let type_id: i64 = row.get(4)?;
    let file_type = FileType::from_id(type_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Integer,
            format!("unknown file type id {}", type_id).into(),
        )
    })?;

    Ok(FileEntry {
        id: row.get(0)?,
        parent_id: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        name: row.get(2)?,
        volume_id: row.get(3)?,
        file_type,
        size: row.get::<_, i64>(5)?.max(0) as u64,
        creation_timestamp: row.get(6)?,
        modification_timestamp: row.get(7)?,
        access_timestamp: row.get(8)?,
        first_seen_timestamp: row.get(9)?,
        last_seen_timestamp: row.get(10)?,
    })
}

fn volume_from_row(row: &Row<'_>) -> SqliteResult<Volume> {
    Ok(Volume {
        id: row.get(0)?,
        mount_point: row.get(1)?,
        device: row.get(2)?,
        file_system: row.get(3)?,
        block_size: row.get(4)?,
        first_seen_timestamp: row.get(5)?,
        last_seen_timestamp: row.get(6)?,
    })
}
