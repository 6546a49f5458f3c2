//! Rollback journal
//!
//! Sibling file `<db>-journal` holding the pre-image of every page dirtied by
//! the current transaction. Header: magic + page size + original page count.
//! Body: a sequence of `(page_no: u32, page_image, checksum: u32)` records.
//! A journal present at open time means an incomplete transaction: the
//! pre-images must be replayed into the main file before any other operation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Error, Result};
use crate::storage::page::{PageId, JOURNAL_MAGIC, PAGE_SIZE};

const HEADER_SIZE: usize = 16 + 4 + 4;

/// Journal path for a given database path.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

fn record_checksum(page_no: PageId, image: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    let mut no = [0u8; 4];
    LittleEndian::write_u32(&mut no, page_no);
    hasher.update(&no);
    hasher.update(image);
    hasher.finalize()
}

/// An open journal for the transaction in progress.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
    /// Page count of the main file when the transaction began
    original_page_count: u32,
}

impl Journal {
    /// Create (or truncate) the journal and write its header.
    pub fn create(db_path: &Path, original_page_count: u32) -> Result<Journal> {
        let path = journal_path(db_path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_u32::<LittleEndian>(PAGE_SIZE as u32)?;
        file.write_u32::<LittleEndian>(original_page_count)?;
        Ok(Journal {
            file,
            path,
            original_page_count,
        })
    }

    /// Append one pre-image record. The caller must `sync` before mutating
    /// the page in memory.
    pub fn append(&mut self, page_no: PageId, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        self.file.write_u32::<LittleEndian>(page_no)?;
        self.file.write_all(image)?;
        self.file
            .write_u32::<LittleEndian>(record_checksum(page_no, image))?;
        Ok(())
    }

    /// Flush journal contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn original_page_count(&self) -> u32 {
        self.original_page_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the journal file. This is the commit point: once the journal is
    /// gone the transaction is durable.
    pub fn remove(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// A journal read back for recovery or rollback.
#[derive(Debug)]
pub struct JournalReader {
    /// Pre-images in append order; replay restores each to the main file
    pub records: Vec<(PageId, Vec<u8>)>,
    /// Page count to truncate the main file back to
    pub original_page_count: u32,
}

impl JournalReader {
    /// Parse a journal file. Records with a bad checksum and anything after a
    /// torn tail are ignored; earlier intact pre-images are still replayed.
    pub fn open(path: &Path) -> Result<JournalReader> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if (len as usize) < HEADER_SIZE {
            // Torn before the header was complete: nothing was journaled, so
            // nothing can have reached the main file.
            return Ok(JournalReader {
                records: Vec::new(),
                original_page_count: 0,
            });
        }

        let mut magic = [0u8; 16];
        file.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(Error::Corrupt("bad journal magic".to_string()));
        }
        let page_size = file.read_u32::<LittleEndian>()?;
        if page_size != PAGE_SIZE as u32 {
            return Err(Error::Corrupt(format!(
                "journal page size {} does not match database",
                page_size
            )));
        }
        let original_page_count = file.read_u32::<LittleEndian>()?;

        let mut records = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        let record_size = (4 + PAGE_SIZE + 4) as u64;
        while offset + record_size <= len {
            file.seek(SeekFrom::Start(offset))?;
            let page_no = file.read_u32::<LittleEndian>()?;
            let mut image = vec![0u8; PAGE_SIZE];
            file.read_exact(&mut image)?;
            let stored = file.read_u32::<LittleEndian>()?;
            if stored != record_checksum(page_no, &image) {
                log::warn!(
                    "journal record for page {} failed checksum, stopping replay here",
                    page_no
                );
                break;
            }
            records.push((page_no, image));
            offset += record_size;
        }

        Ok(JournalReader {
            records,
            original_page_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn page_filled(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn test_journal_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");

        let mut journal = Journal::create(&db, 5).unwrap();
        journal.append(1, &page_filled(0xAA)).unwrap();
        journal.append(3, &page_filled(0xBB)).unwrap();
        journal.sync().unwrap();
        let path = journal.path().to_path_buf();
        drop(journal);

        let reader = JournalReader::open(&path).unwrap();
        assert_eq!(reader.original_page_count, 5);
        assert_eq!(reader.records.len(), 2);
        assert_eq!(reader.records[0].0, 1);
        assert_eq!(reader.records[0].1, page_filled(0xAA));
        assert_eq!(reader.records[1].0, 3);
    }

    #[test]
    fn test_journal_torn_tail_ignored() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");

        let mut journal = Journal::create(&db, 2).unwrap();
        journal.append(1, &page_filled(0x11)).unwrap();
        journal.sync().unwrap();
        let path = journal.path().to_path_buf();
        drop(journal);

        // Append half a record to simulate a crash mid-write.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0u8; 100]).unwrap();
        drop(f);

        let reader = JournalReader::open(&path).unwrap();
        assert_eq!(reader.records.len(), 1);
        assert_eq!(reader.records[0].1, page_filled(0x11));
    }

    #[test]
    fn test_journal_bad_checksum_stops_replay() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");

        let mut journal = Journal::create(&db, 2).unwrap();
        journal.append(1, &page_filled(0x11)).unwrap();
        journal.append(2, &page_filled(0x22)).unwrap();
        journal.sync().unwrap();
        let path = journal.path().to_path_buf();
        drop(journal);

        // Corrupt one byte of the second record's image.
        let mut data = std::fs::read(&path).unwrap();
        let second_image_start = HEADER_SIZE + (4 + PAGE_SIZE + 4) + 4;
        data[second_image_start + 10] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let reader = JournalReader::open(&path).unwrap();
        assert_eq!(reader.records.len(), 1);
    }

    #[test]
    fn test_journal_remove_is_commit_point() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let journal = Journal::create(&db, 2).unwrap();
        let path = journal.path().to_path_buf();
        assert!(path.exists());
        journal.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_journal_path_naming() {
        assert_eq!(
            journal_path(Path::new("/tmp/app.db")),
            PathBuf::from("/tmp/app.db-journal")
        );
    }
}
