//! Pager: page cache, free-list, and transactional page I/O
//!
//! The pager presents the database file as an array of fixed-size pages with
//! a write-through cache, and guarantees that either all page writes of a
//! transaction reach the file or none do. Inside a transaction every mutation
//! stays in the cache; the rollback journal receives the pre-image of each
//! page before its first modification. The main file is only touched at
//! commit, under an exclusive lock, in this order: pre-images to journal,
//! fsync journal, new images to file, fsync file, remove journal, fsync
//! directory. The journal's removal is the commit point.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::btree;
use crate::storage::journal::{journal_path, Journal, JournalReader};
use crate::storage::page::{
    encode_free_page, free_page_next, Meta, PageId, PAGE_SIZE,
};

/// Pager over one database file
#[derive(Debug)]
pub struct Pager {
    file: File,
    path: PathBuf,
    /// Page cache; holds committed images plus in-transaction mutations
    cache: HashMap<PageId, Vec<u8>>,
    /// Pages modified by the current transaction
    dirty: HashSet<PageId>,
    /// Pages whose pre-image is already in the journal
    journaled: HashSet<PageId>,
    /// Open journal while a write transaction is active
    journal: Option<Journal>,
    /// Set once commit has started writing new images to the main file
    commit_started: bool,
    meta: Meta,
}

impl Pager {
    /// Open a database file, creating and initializing it if empty. If a
    /// journal is present from an interrupted transaction, it is replayed
    /// before anything else; the caller must hold an exclusive lock when that
    /// is possible.
    pub fn open(path: impl AsRef<Path>) -> Result<Pager> {
        recover_if_needed(path.as_ref())?;
        Self::open_no_recovery(path)
    }

    /// Open without touching the journal. For callers that have already
    /// replayed a hot journal, or determined that the journal on disk
    /// belongs to a live writer and must be left alone.
    pub fn open_no_recovery(path: impl AsRef<Path>) -> Result<Pager> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        let meta = if len == 0 {
            // Fresh database: meta page plus an empty catalog root leaf.
            let meta = Meta::new();
            file.write_all(&meta.encode())?;
            file.write_all(&btree::empty_leaf_image(false))?;
            file.sync_all()?;
            fsync_dir(&path)?;
            meta
        } else {
            if len % PAGE_SIZE as u64 != 0 {
                return Err(Error::Corrupt(format!(
                    "database size {} is not a multiple of the page size",
                    len
                )));
            }
            let mut buf = vec![0u8; PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let meta = Meta::decode(&buf)?;
            if (meta.page_count as u64) * (PAGE_SIZE as u64) != len {
                return Err(Error::Corrupt(format!(
                    "meta page count {} does not match file size",
                    meta.page_count
                )));
            }
            meta
        };

        Ok(Pager {
            file,
            path,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            journaled: HashSet::new(),
            journal: None,
            commit_started: false,
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    /// Read the meta page directly from disk, bypassing the cache. Used by
    /// readers to detect schema changes made by other connections.
    pub fn read_disk_meta(&mut self) -> Result<Meta> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        Meta::decode(&buf)
    }

    /// Drop all cached pages and re-read the meta page. Called after another
    /// connection may have committed.
    pub fn invalidate_cache(&mut self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::Internal(
                "cache invalidation during a transaction".to_string(),
            ));
        }
        self.cache.clear();
        self.meta = self.read_disk_meta()?;
        Ok(())
    }

    /// Get a copy of a page image.
    pub fn get(&mut self, page_no: PageId) -> Result<Vec<u8>> {
        if page_no >= self.meta.page_count {
            return Err(Error::Corrupt(format!(
                "page {} out of range (page count {})",
                page_no, self.meta.page_count
            )));
        }
        if let Some(image) = self.cache.get(&page_no) {
            return Ok(image.clone());
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        self.cache.insert(page_no, buf.clone());
        Ok(buf)
    }

    /// Open the journal for a new write transaction. The caller must hold at
    /// least a RESERVED lock.
    pub fn begin_write(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::Internal("transaction already active".to_string()));
        }
        self.journal = Some(Journal::create(&self.path, self.meta.page_count)?);
        self.journaled.clear();
        self.dirty.clear();
        self.commit_started = false;
        Ok(())
    }

    /// Record the pre-image of a page before its first modification in this
    /// transaction, and flush the journal so the pre-image is durable before
    /// the in-memory image diverges. Pages allocated after the transaction
    /// began have no pre-image; rollback truncates them away.
    pub fn mark_dirty(&mut self, page_no: PageId) -> Result<()> {
        if self.journal.is_none() {
            return Err(Error::Internal(
                "page write outside a write transaction".to_string(),
            ));
        }
        if !self.journaled.contains(&page_no) {
            let original_count = self.journal.as_ref().unwrap().original_page_count();
            if page_no < original_count {
                let image = self.get(page_no)?;
                let journal = self.journal.as_mut().unwrap();
                journal.append(page_no, &image)?;
                journal.sync()?;
            }
            self.journaled.insert(page_no);
        }
        self.dirty.insert(page_no);
        Ok(())
    }

    /// Replace a page image in the cache (journaling the pre-image first).
    pub fn write(&mut self, page_no: PageId, image: Vec<u8>) -> Result<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        if page_no >= self.meta.page_count {
            return Err(Error::Internal(format!(
                "write to unallocated page {}",
                page_no
            )));
        }
        self.mark_dirty(page_no)?;
        self.cache.insert(page_no, image);
        Ok(())
    }

    /// Allocate a page: pop the free-list head or extend the file. The page
    /// image is zeroed.
    pub fn allocate(&mut self) -> Result<PageId> {
        let page_no = if self.meta.freelist_head != 0 {
            let head = self.meta.freelist_head;
            let image = self.get(head)?;
            let next = free_page_next(&image)?;
            self.meta.freelist_head = next;
            self.write_meta()?;
            head
        } else {
            let page_no = self.meta.page_count;
            self.meta.page_count += 1;
            self.write_meta()?;
            // Grow the cache image; the file itself grows at commit.
            self.cache.insert(page_no, vec![0u8; PAGE_SIZE]);
            page_no
        };
        self.mark_dirty(page_no)?;
        self.cache.insert(page_no, vec![0u8; PAGE_SIZE]);
        Ok(page_no)
    }

    /// Return a page to the free-list.
    pub fn free(&mut self, page_no: PageId) -> Result<()> {
        if page_no == 0 || page_no >= self.meta.page_count {
            return Err(Error::Internal(format!("cannot free page {}", page_no)));
        }
        let image = encode_free_page(self.meta.freelist_head);
        self.write(page_no, image)?;
        self.meta.freelist_head = page_no;
        self.write_meta()?;
        Ok(())
    }

    /// Bump the schema-change counter on the meta page (DDL).
    pub fn bump_schema_counter(&mut self) -> Result<()> {
        self.meta.schema_counter = self.meta.schema_counter.wrapping_add(1);
        self.write_meta()
    }

    fn write_meta(&mut self) -> Result<()> {
        self.mark_dirty(0)?;
        self.cache.insert(0, self.meta.encode());
        Ok(())
    }

    /// Flush all dirty pages to the main file and make the transaction
    /// durable. The caller must hold an EXCLUSIVE lock.
    pub fn commit(&mut self) -> Result<()> {
        let journal = match self.journal.as_mut() {
            Some(j) => j,
            None => return Ok(()), // read-only transaction
        };
        journal.sync()?;

        self.commit_started = true;
        let mut pages: Vec<PageId> = self.dirty.iter().copied().collect();
        pages.sort_unstable();
        for page_no in pages {
            let image = self
                .cache
                .get(&page_no)
                .ok_or_else(|| Error::Internal(format!("dirty page {} not cached", page_no)))?;
            self.file
                .seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
            self.file.write_all(image)?;
        }
        self.file.sync_all()?;

        let journal = self.journal.take().unwrap();
        journal.remove()?;
        fsync_dir(&self.path)?;

        log::debug!("committed {} dirty pages", self.dirty.len());
        self.dirty.clear();
        self.journaled.clear();
        self.commit_started = false;
        Ok(())
    }

    /// Undo the current transaction. If commit had already begun writing new
    /// images, the journal's pre-images are replayed into the main file;
    /// otherwise the main file was never touched and the staged cache is
    /// simply discarded.
    pub fn rollback(&mut self) -> Result<()> {
        let journal = match self.journal.take() {
            Some(j) => j,
            None => return Ok(()),
        };

        if self.commit_started {
            let reader = JournalReader::open(journal.path())?;
            replay(&mut self.file, &reader)?;
            self.commit_started = false;
        }
        journal.remove()?;
        fsync_dir(&self.path)?;

        // Throw away staged images and reload the pre-transaction meta.
        for page_no in self.dirty.drain() {
            self.cache.remove(&page_no);
        }
        self.journaled.clear();
        self.meta = self.read_disk_meta()?;
        log::debug!("transaction rolled back");
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if self.journal.is_some() {
            let _ = self.rollback();
        }
    }
}

/// Replay a valid journal into the database file, if one exists. Called
/// before anything reads the file.
pub fn recover_if_needed(db_path: &Path) -> Result<()> {
    let jpath = journal_path(db_path);
    if !jpath.exists() {
        return Ok(());
    }
    log::info!("journal found at {}, recovering", jpath.display());

    let reader = JournalReader::open(&jpath)?;
    if !reader.records.is_empty() || reader.original_page_count > 0 {
        let mut file = OpenOptions::new().read(true).write(true).open(db_path)?;
        replay(&mut file, &reader)?;
    }
    std::fs::remove_file(&jpath)?;
    fsync_dir(db_path)?;
    log::info!("recovery complete, {} pages restored", reader.records.len());
    Ok(())
}

fn replay(file: &mut File, reader: &JournalReader) -> Result<()> {
    for (page_no, image) in &reader.records {
        file.seek(SeekFrom::Start(*page_no as u64 * PAGE_SIZE as u64))?;
        file.write_all(image)?;
    }
    if reader.original_page_count > 0 {
        file.set_len(reader.original_page_count as u64 * PAGE_SIZE as u64)?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
