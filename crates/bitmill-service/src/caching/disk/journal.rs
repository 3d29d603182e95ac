//! A journaled, size bounded LRU cache of files.
//!
//! The cache lives in a single directory. Every entry is one file named by its key, and all
//! operations are recorded in a `journal` file so that the LRU order survives restarts.
//!
//! The journal starts with a header:
//!
//! ```text
//! bitmill.DiskLruCache
//! 1
//! 100
//! 1
//!
//! ```
//!
//! The magic string, the journal format version, the application version and the number of
//! values per entry, followed by a blank line. Each following line records one operation:
//!
//! - `DIRTY key`: an entry is being created or updated. Every `DIRTY` is followed by a `CLEAN`
//!   or a `REMOVE`, otherwise the entry is incomplete and deleted on the next open.
//! - `CLEAN key length`: an entry was published and is readable.
//! - `REMOVE key`: an entry was deleted.
//! - `READ key`: an entry was read, moving it to the most recently used position.
//!
//! Redundant lines accumulate over time, and the journal is compacted once there are many.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tempfile::NamedTempFile;

use super::{CacheFile, Snapshot};
use crate::caching::catch_not_found;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TEMP: &str = "journal.tmp";
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
pub const MAGIC: &str = "bitmill.DiskLruCache";
pub const VERSION: &str = "1";
const VALUE_COUNT: &str = "1";

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Files created by editors start with this prefix.
const DIRTY_PREFIX: &str = ".dirty-";

/// Compact the journal once this many lines are redundant.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

#[derive(Debug, Default)]
struct Entry {
    length: u64,
    readable: bool,
    current_edit: Option<u64>,
}

struct State {
    entries: LruCache<String, Entry>,
    size: u64,
    max_size: u64,
    /// `None` once the cache was deleted.
    journal: Option<BufWriter<File>>,
    redundant_op_count: usize,
    next_edit: u64,
}

/// A journaled LRU cache of files with a single value per entry.
pub struct DiskLruCache {
    directory: PathBuf,
    app_version: u32,
    state: Mutex<State>,
}

impl DiskLruCache {
    /// Opens the cache in `directory`, creating it if it does not exist yet.
    ///
    /// A corrupt journal wipes the directory and starts over with an empty cache.
    pub fn open(directory: impl Into<PathBuf>, app_version: u32, max_size: u64) -> io::Result<Self> {
        if max_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_size must be positive",
            ));
        }
        let directory = directory.into();

        // A crash during a rebuild may leave only the backup behind.
        let backup = directory.join(JOURNAL_FILE_BACKUP);
        if backup.exists() {
            let journal = directory.join(JOURNAL_FILE);
            if journal.exists() {
                fs::remove_file(&backup)?;
            } else {
                fs::rename(&backup, &journal)?;
            }
        }

        let cache = Self {
            directory,
            app_version,
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                size: 0,
                max_size,
                journal: None,
                redundant_op_count: 0,
                next_edit: 0,
            }),
        };

        if cache.journal_path().exists() {
            match cache.read_journal() {
                Ok(()) => return Ok(cache),
                Err(error) => {
                    tracing::warn!(
                        directory = %cache.directory.display(),
                        error = &error as &dyn std::error::Error,
                        "disk cache journal is corrupt, removing"
                    );
                    cache.delete()?;
                }
            }
        }

        fs::create_dir_all(&cache.directory)?;
        let mut state = cache.lock();
        cache.rebuild_journal(&mut state)?;
        drop(state);
        Ok(cache)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journal_path(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn read_journal(&self) -> io::Result<()> {
        let mut contents = String::new();
        File::open(self.journal_path())?.read_to_string(&mut contents)?;

        let mut lines = contents.split_terminator('\n');
        let app_version = self.app_version.to_string();
        let header = [MAGIC, VERSION, app_version.as_str(), VALUE_COUNT, ""];
        for expected in header {
            if lines.next() != Some(expected) {
                return Err(invalid_data("unexpected journal header"));
            }
        }

        let mut state = self.lock();
        let mut line_count = 0;
        for line in lines {
            read_journal_line(&mut state.entries, line)?;
            line_count += 1;
        }
        state.redundant_op_count = line_count - state.entries.len();

        self.process_journal(&mut state)?;

        // A truncated last line is repaired by writing a fresh journal.
        if !contents.ends_with('\n') {
            self.rebuild_journal(&mut state)?;
        } else {
            let file = OpenOptions::new().append(true).open(self.journal_path())?;
            state.journal = Some(BufWriter::new(file));
        }
        Ok(())
    }

    /// Computes the initial size and deletes incomplete entries and leftover temp files.
    fn process_journal(&self, state: &mut State) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(self.directory.join(JOURNAL_FILE_TEMP)))?;

        let mut incomplete = Vec::new();
        for (key, entry) in state.entries.iter() {
            if entry.current_edit.is_some() || !entry.readable {
                incomplete.push(key.clone());
            } else {
                state.size += entry.length;
            }
        }
        for key in incomplete {
            state.entries.pop(&key);
            catch_not_found(|| fs::remove_file(self.entry_path(&key)))?;
        }

        for dir_entry in fs::read_dir(&self.directory)? {
            let dir_entry = dir_entry?;
            if dir_entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(DIRTY_PREFIX))
            {
                catch_not_found(|| fs::remove_file(dir_entry.path()))?;
            }
        }
        Ok(())
    }

    /// Writes a compacted journal, replacing the current one atomically.
    fn rebuild_journal(&self, state: &mut State) -> io::Result<()> {
        if let Some(mut journal) = state.journal.take() {
            journal.flush()?;
        }

        let temp_path = self.directory.join(JOURNAL_FILE_TEMP);
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            writeln!(writer, "{MAGIC}")?;
            writeln!(writer, "{VERSION}")?;
            writeln!(writer, "{}", self.app_version)?;
            writeln!(writer, "{VALUE_COUNT}")?;
            writeln!(writer)?;
            // oldest first, so that replaying restores the LRU order
            for (key, entry) in state.entries.iter().rev() {
                if entry.current_edit.is_some() {
                    writeln!(writer, "{DIRTY} {key}")?;
                } else {
                    writeln!(writer, "{CLEAN} {key} {}", entry.length)?;
                }
            }
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        let journal_path = self.journal_path();
        let backup_path = self.directory.join(JOURNAL_FILE_BACKUP);
        if journal_path.exists() {
            fs::rename(&journal_path, &backup_path)?;
        }
        fs::rename(&temp_path, &journal_path)?;
        catch_not_found(|| fs::remove_file(&backup_path))?;

        let file = OpenOptions::new().append(true).open(&journal_path)?;
        state.journal = Some(BufWriter::new(file));
        state.redundant_op_count = 0;
        Ok(())
    }

    fn journal_rebuild_required(state: &State) -> bool {
        state.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
            && state.redundant_op_count >= state.entries.len()
    }

    fn append(state: &mut State, line: std::fmt::Arguments<'_>) -> io::Result<()> {
        let journal = state.journal.as_mut().ok_or_else(closed)?;
        journal.write_fmt(line)?;
        journal.write_all(b"\n")
    }

    fn flush_journal(state: &mut State) -> io::Result<()> {
        match state.journal.as_mut() {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }

    /// Returns a snapshot of the entry for `key`, or `None` if it is not readable.
    ///
    /// The snapshot holds an open file handle, so a later eviction does not affect it.
    pub fn get(&self, key: &str) -> io::Result<Option<Snapshot>> {
        validate_key(key)?;
        let mut state = self.lock();
        if state.journal.is_none() {
            return Err(closed());
        }

        let length = match state.entries.get(key) {
            Some(entry) if entry.readable => entry.length,
            _ => return Ok(None),
        };

        let path = self.entry_path(key);
        let Some(file) = catch_not_found(|| File::open(&path))? else {
            // removed behind our back
            return Ok(None);
        };

        state.redundant_op_count += 1;
        Self::append(&mut state, format_args!("{READ} {key}"))?;
        if Self::journal_rebuild_required(&state) {
            self.rebuild_journal(&mut state)?;
        }

        Ok(Some(Snapshot {
            key: key.to_owned(),
            file: CacheFile {
                path,
                handle: Arc::new(Mutex::new(file)),
                len: length,
            },
        }))
    }

    /// Starts editing the entry for `key`.
    ///
    /// Returns `None` if another edit of the same key is in progress.
    pub fn edit(&self, key: &str) -> io::Result<Option<Editor<'_>>> {
        validate_key(key)?;
        let temp_file = tempfile::Builder::new()
            .prefix(DIRTY_PREFIX)
            .tempfile_in(&self.directory)?;

        let mut state = self.lock();
        if state.journal.is_none() {
            return Err(closed());
        }

        let edit = state.next_edit;
        let entry = state.entries.get_or_insert_mut(key.to_owned(), Entry::default);
        if entry.current_edit.is_some() {
            return Ok(None);
        }
        entry.current_edit = Some(edit);
        state.next_edit += 1;

        // Flush right away, so that a crash does not leave an unrecorded file behind.
        Self::append(&mut state, format_args!("{DIRTY} {key}"))?;
        Self::flush_journal(&mut state)?;

        Ok(Some(Editor {
            cache: self,
            key: key.to_owned(),
            edit,
            file: Some(temp_file),
        }))
    }

    fn complete_edit(&self, key: &str, edit: u64, published: Option<u64>) -> io::Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let Some(entry) = state.entries.peek_mut(key) else {
            return Ok(());
        };
        if entry.current_edit != Some(edit) {
            return Err(io::Error::other("edit didn't match the current edit"));
        }
        entry.current_edit = None;

        state.redundant_op_count += 1;
        match published {
            Some(length) => {
                let previous = if entry.readable { entry.length } else { 0 };
                entry.readable = true;
                entry.length = length;
                state.size = state.size - previous + length;
                Self::append(state, format_args!("{CLEAN} {key} {length}"))?;
            }
            None if entry.readable => {
                let length = entry.length;
                Self::append(state, format_args!("{CLEAN} {key} {length}"))?;
            }
            None => {
                state.entries.pop(key);
                Self::append(state, format_args!("{REMOVE} {key}"))?;
            }
        }
        Self::flush_journal(state)?;

        self.trim_to_size(state)?;
        if Self::journal_rebuild_required(state) {
            self.rebuild_journal(state)?;
        }
        Ok(())
    }

    /// Evicts least recently used entries until the cache fits into `max_size`.
    fn trim_to_size(&self, state: &mut State) -> io::Result<()> {
        while state.size > state.max_size {
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.current_edit.is_none())
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => self.remove_entry(state, &key)?,
                None => break,
            }
        }
        Ok(())
    }

    fn remove_entry(&self, state: &mut State, key: &str) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(self.entry_path(key)))?;
        if let Some(entry) = state.entries.pop(key) {
            state.size -= entry.length;
        }
        state.redundant_op_count += 1;
        Self::append(state, format_args!("{REMOVE} {key}"))?;
        tracing::trace!(key, "removed disk cache entry");
        Ok(())
    }

    /// Removes the entry for `key`, unless it is being edited.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, key: &str) -> io::Result<bool> {
        validate_key(key)?;
        let mut state = self.lock();
        let state = &mut *state;
        if state.journal.is_none() {
            return Err(closed());
        }
        match state.entries.peek(key) {
            Some(entry) if entry.current_edit.is_none() => {}
            _ => return Ok(false),
        }

        self.remove_entry(state, key)?;
        Self::flush_journal(state)?;
        if Self::journal_rebuild_required(state) {
            self.rebuild_journal(state)?;
        }
        Ok(true)
    }

    /// The number of bytes stored in published entries.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.lock().max_size
    }

    /// The number of entries, including ones that are being created.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changes the maximum size, evicting entries if needed.
    pub fn set_max_size(&self, max_size: u64) -> io::Result<()> {
        let mut state = self.lock();
        state.max_size = max_size;
        self.trim_to_size(&mut state)?;
        Self::flush_journal(&mut state)
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.lock();
        self.trim_to_size(&mut state)?;
        Self::flush_journal(&mut state)
    }

    /// Closes the cache and deletes all of its files.
    ///
    /// The instance is unusable afterwards, open it again to start over.
    pub fn delete(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.journal = None;
        state.entries.clear();
        state.size = 0;
        state.redundant_op_count = 0;
        catch_not_found(|| fs::remove_dir_all(&self.directory))?;
        Ok(())
    }
}

impl std::fmt::Debug for DiskLruCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLruCache")
            .field("directory", &self.directory)
            .field("app_version", &self.app_version)
            .finish()
    }
}

fn read_journal_line(entries: &mut LruCache<String, Entry>, line: &str) -> io::Result<()> {
    let mut parts = line.split(' ');
    let (Some(op), Some(key)) = (parts.next(), parts.next()) else {
        return Err(invalid_data("unexpected journal line"));
    };
    validate_key(key)?;

    match (op, parts.next(), parts.next()) {
        (REMOVE, None, _) => {
            entries.pop(key);
        }
        (CLEAN, Some(length), None) => {
            let length = length
                .parse()
                .map_err(|_| invalid_data("unexpected journal line"))?;
            let entry = entries.get_or_insert_mut(key.to_owned(), Entry::default);
            entry.readable = true;
            entry.length = length;
            entry.current_edit = None;
        }
        (DIRTY, None, _) => {
            let entry = entries.get_or_insert_mut(key.to_owned(), Entry::default);
            entry.current_edit = Some(u64::MAX);
        }
        (READ, None, _) => {
            // touches the LRU order
            entries.get(key);
        }
        _ => return Err(invalid_data("unexpected journal line")),
    }
    Ok(())
}

fn validate_key(key: &str) -> io::Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 120
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("keys must match [a-z0-9_-]{{1,120}}: {key:?}"),
        ))
    }
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn closed() -> io::Error {
    io::Error::other("cache is closed")
}

/// An in-progress edit of a single entry.
///
/// Writes go to a temporary file in the cache directory which only becomes visible on
/// [`commit`](Self::commit). Dropping the editor aborts the edit.
pub struct Editor<'a> {
    cache: &'a DiskLruCache,
    key: String,
    edit: u64,
    file: Option<NamedTempFile>,
}

impl Editor<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The file to write the new value to.
    pub fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .map(NamedTempFile::as_file_mut)
            .ok_or_else(|| io::Error::other("editor is already completed"))
    }

    /// Publishes the written file as the new value of the entry.
    pub fn commit(mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        match self.persist(file) {
            Ok(length) => self
                .cache
                .complete_edit(&self.key, self.edit, Some(length)),
            Err(error) => {
                self.cache.complete_edit(&self.key, self.edit, None)?;
                Err(error)
            }
        }
    }

    fn persist(&self, mut temp_file: NamedTempFile) -> io::Result<u64> {
        temp_file.as_file_mut().flush()?;
        let length = temp_file.as_file().metadata()?.len();
        let path = self.cache.entry_path(&self.key);

        // Someone could remove the cache directory from under us, so retry once.
        const MAX_RETRIES: usize = 1;
        let mut retries = 0;
        loop {
            retries += 1;
            match temp_file.persist(&path) {
                Ok(_) => break Ok(length),
                Err(e) => {
                    temp_file = e.file;
                    let error = e.error;
                    tracing::error!(
                        path = %path.display(),
                        error = &error as &dyn std::error::Error,
                        "failed to persist disk cache entry"
                    );
                    if retries > MAX_RETRIES {
                        break Err(error);
                    }
                    fs::create_dir_all(&self.cache.directory)?;
                }
            }
        }
    }

    /// Discards the edit. A previously published value stays readable.
    pub fn abort(mut self) -> io::Result<()> {
        match self.file.take() {
            Some(_) => self.cache.complete_edit(&self.key, self.edit, None),
            None => Ok(()),
        }
    }
}

impl Drop for Editor<'_> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(error) = self.cache.complete_edit(&self.key, self.edit, None) {
                tracing::warn!(
                    key = self.key,
                    error = &error as &dyn std::error::Error,
                    "failed to abort disk cache edit"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const APP_VERSION: u32 = 100;

    fn write(cache: &DiskLruCache, key: &str, value: &str) {
        let mut editor = cache.edit(key).unwrap().unwrap();
        editor.file().unwrap().write_all(value.as_bytes()).unwrap();
        editor.commit().unwrap();
    }

    fn read(cache: &DiskLruCache, key: &str) -> Option<String> {
        let snapshot = cache.get(key).unwrap()?;
        Some(String::from_utf8(snapshot.read_bytes().unwrap().to_vec()).unwrap())
    }

    fn journal(dir: &Path) -> String {
        fs::read_to_string(dir.join(JOURNAL_FILE)).unwrap()
    }

    #[test]
    fn test_empty_cache_writes_header() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        assert_eq!(cache.size(), 0);
        assert_eq!(journal(dir.path()), "bitmill.DiskLruCache\n1\n100\n1\n\n");
    }

    #[test]
    fn test_write_and_read() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();

        write(&cache, "k1", "ABC");
        assert_eq!(read(&cache, "k1").as_deref(), Some("ABC"));
        assert_eq!(cache.size(), 3);
        cache.flush().unwrap();
        assert_eq!(
            journal(dir.path()),
            "bitmill.DiskLruCache\n1\n100\n1\n\nDIRTY k1\nCLEAN k1 3\nREAD k1\n"
        );
    }

    #[test]
    fn test_abort_leaves_nothing_visible() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();

        let mut editor = cache.edit("k1").unwrap().unwrap();
        editor.file().unwrap().write_all(b"ABC").unwrap();
        editor.abort().unwrap();

        assert!(read(&cache, "k1").is_none());
        assert!(!dir.path().join("k1").exists());
        assert!(cache.is_empty());

        // dropping behaves the same
        let mut editor = cache.edit("k2").unwrap().unwrap();
        editor.file().unwrap().write_all(b"ABC").unwrap();
        drop(editor);
        assert!(read(&cache, "k2").is_none());
    }

    #[test]
    fn test_aborted_update_keeps_old_value() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        write(&cache, "k1", "ABC");

        let mut editor = cache.edit("k1").unwrap().unwrap();
        editor.file().unwrap().write_all(b"DEFG").unwrap();
        editor.abort().unwrap();

        assert_eq!(read(&cache, "k1").as_deref(), Some("ABC"));
    }

    #[test]
    fn test_single_editor_per_key() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();

        let editor = cache.edit("k1").unwrap().unwrap();
        assert!(cache.edit("k1").unwrap().is_none());
        drop(editor);
        assert!(cache.edit("k1").unwrap().is_some());
    }

    #[test]
    fn test_invalid_keys() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        let long = "a".repeat(121);
        for key in ["", "has space", "has/slash", "UPPER", long.as_str()] {
            assert!(cache.get(key).is_err(), "{key:?} should be invalid");
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 10).unwrap();

        write(&cache, "a", "aaaa");
        write(&cache, "b", "bbbb");
        // touch `a`, so that `b` is the oldest
        assert!(read(&cache, "a").is_some());
        write(&cache, "c", "cccc");

        assert!(cache.size() <= 10);
        assert!(read(&cache, "b").is_none());
        assert!(read(&cache, "a").is_some());
        assert!(read(&cache, "c").is_some());
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_snapshot_survives_eviction() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 10).unwrap();
        write(&cache, "a", "aaaa");

        let snapshot = cache.get("a").unwrap().unwrap();
        assert!(cache.remove("a").unwrap());
        assert!(cache.get("a").unwrap().is_none());
        assert_eq!(&snapshot.read_bytes().unwrap()[..], b"aaaa");
    }

    #[test]
    fn test_reopen_restores_entries() {
        let dir = bitmill_test::tempdir();
        {
            let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
            write(&cache, "a", "aaaa");
            write(&cache, "b", "bb");
            assert!(cache.remove("a").unwrap());
            cache.flush().unwrap();
        }

        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        assert_eq!(cache.size(), 2);
        assert_eq!(read(&cache, "b").as_deref(), Some("bb"));
        assert!(read(&cache, "a").is_none());
    }

    #[test]
    fn test_reopen_drops_incomplete_entries() {
        let dir = bitmill_test::tempdir();
        {
            let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
            write(&cache, "a", "aaaa");
            let editor = cache.edit("b").unwrap().unwrap();
            // simulate a crash during the edit
            std::mem::forget(editor);
        }

        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(read(&cache, "b").is_none());
        assert_eq!(read(&cache, "a").as_deref(), Some("aaaa"));

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(DIRTY_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_corrupt_journal_starts_empty() {
        let dir = bitmill_test::tempdir();
        {
            let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
            write(&cache, "a", "aaaa");
        }
        fs::write(
            dir.path().join(JOURNAL_FILE),
            "bitmill.DiskLruCache\n1\n100\n1\n\nBOGUS a\n",
        )
        .unwrap();

        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        assert!(cache.is_empty());
        assert!(!dir.path().join("a").exists());
        write(&cache, "b", "bb");
        assert_eq!(read(&cache, "b").as_deref(), Some("bb"));
    }

    #[test]
    fn test_app_version_mismatch_starts_empty() {
        let dir = bitmill_test::tempdir();
        {
            let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
            write(&cache, "a", "aaaa");
        }
        let cache = DiskLruCache::open(dir.path(), APP_VERSION + 1, 1024).unwrap();
        assert!(read(&cache, "a").is_none());
    }

    #[test]
    fn test_backup_is_promoted() {
        let dir = bitmill_test::tempdir();
        {
            let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
            write(&cache, "a", "aaaa");
        }
        fs::rename(
            dir.path().join(JOURNAL_FILE),
            dir.path().join(JOURNAL_FILE_BACKUP),
        )
        .unwrap();

        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        assert_eq!(read(&cache, "a").as_deref(), Some("aaaa"));
        assert!(!dir.path().join(JOURNAL_FILE_BACKUP).exists());
    }

    #[test]
    fn test_journal_is_compacted() {
        let dir = bitmill_test::tempdir();
        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        write(&cache, "a", "aaaa");

        for _ in 0..REDUNDANT_OP_COMPACT_THRESHOLD + 10 {
            assert!(read(&cache, "a").is_some());
        }
        cache.flush().unwrap();

        let lines = journal(dir.path()).lines().count();
        assert!(lines < 100, "journal has {lines} lines");
        drop(cache);

        let cache = DiskLruCache::open(dir.path(), APP_VERSION, 1024).unwrap();
        assert_eq!(read(&cache, "a").as_deref(), Some("aaaa"));
    }

    #[test]
    fn test_delete_wipes_directory() {
        let dir = bitmill_test::tempdir();
        let cache_dir = dir.path().join("cache");
        let cache = DiskLruCache::open(&cache_dir, APP_VERSION, 1024).unwrap();
        write(&cache, "a", "aaaa");

        cache.delete().unwrap();
        assert!(!cache_dir.exists());
        assert!(cache.get("a").is_err());
    }
}
