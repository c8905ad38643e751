//! Paged key-value store on a block device, one entry per field
//!
//! Each 512-byte page holds at most one entry:
//!
//! ```text
//! [tag: u8][len: u16 LE][postcard(PageEntry) ...][padding]
//! ```
//!
//! A page whose tag is not [`LIVE`] is free. Entries are independent: there
//! is no multi-key commit, so a save interrupted halfway leaves a mix of old
//! and new fields, which load accepts as long as every field parses.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use super::{Backend, Entry, check_record};
use crate::error::StoreError;
use crate::record::{self, FIELD_NAMES, Indicator, StateRecord};
use crate::time_codec;

/// Page size, one block of the device
pub const PAGE_SIZE: usize = Block::LEN;
/// Pages reserved for the store when none is given
pub const DEFAULT_PAGE_COUNT: u32 = 16;

/// Tag of a page holding an entry
const LIVE: u8 = 0xA5;
const HEADER_LEN: usize = 3;
const MAX_ENTRY_LEN: usize = PAGE_SIZE - HEADER_LEN;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct PageEntry<'a> {
    #[serde(borrow)]
    key: &'a str,
    #[serde(borrow)]
    value: &'a str,
}

/// String-to-string store over a range of blocks, with a one-page cache.
pub struct PagedKvStore<D: BlockDevice> {
    device: D,
    first_block: u32,
    page_count: u32,
    cache: Block,
    cached_page: Option<u32>,
}

impl<D: BlockDevice> PagedKvStore<D> {
    /// Open the store on `page_count` blocks starting at `first_block`.
    pub fn open(device: D, first_block: u32, page_count: u32) -> Result<Self, StoreError> {
        let BlockCount(available) = device
            .num_blocks()
            .map_err(|e| StoreError::MediaUnavailable(format!("block device: {e:?}")))?;
        let end = first_block.checked_add(page_count);
        if page_count == 0 || end.is_none_or(|end| end > available) {
            return Err(StoreError::MediaUnavailable(format!(
                "{page_count} pages from block {first_block} do not fit in {available} blocks"
            )));
        }
        Ok(Self {
            device,
            first_block,
            page_count,
            cache: Block::new(),
            cached_page: None,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn release(self) -> D {
        self.device
    }

    fn load_page(&mut self, page: u32) -> Result<&Block, StoreError> {
        if self.cached_page != Some(page) {
            trace!("Paged store cache miss on page {}", page);
            // Drop the cache first so a failed read cannot leave stale
            // contents labelled with the new page.
            self.cached_page = None;
            self.device
                .read(
                    core::slice::from_mut(&mut self.cache),
                    BlockIdx(self.first_block + page),
                )
                .map_err(|e| StoreError::MediaUnavailable(format!("page {page}: {e:?}")))?;
            self.cached_page = Some(page);
        }
        Ok(&self.cache)
    }

    fn store_page(&mut self, page: u32, block: Block) -> Result<(), StoreError> {
        self.cached_page = None;
        self.device
            .write(core::slice::from_ref(&block), BlockIdx(self.first_block + page))
            .map_err(|e| StoreError::Write(format!("page {page}: {e:?}")))?;
        self.cache = block;
        self.cached_page = Some(page);
        Ok(())
    }

    /// Key and value of a live page, `None` for a free one.
    fn read_entry(&mut self, page: u32) -> Result<Option<(String, String)>, StoreError> {
        let block = self.load_page(page)?;
        let bytes = &block.contents;
        if bytes[0] != LIVE {
            return Ok(None);
        }
        let len = usize::from(u16::from_le_bytes([bytes[1], bytes[2]]));
        let payload = bytes
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or(StoreError::SchemaViolation("page entry length exceeds the page"))?;
        let entry: PageEntry<'_> = postcard::from_bytes(payload)
            .map_err(|_| StoreError::SchemaViolation("page entry is not decodable"))?;
        Ok(Some((entry.key.to_string(), entry.value.to_string())))
    }

    /// Page holding `key` and the first free page seen, if any.
    fn locate(&mut self, key: &str) -> Result<(Option<u32>, Option<u32>), StoreError> {
        let mut free = None;
        for page in 0..self.page_count {
            match self.read_entry(page) {
                Ok(Some((k, _))) if k == key => return Ok((Some(page), free)),
                Ok(Some(_)) => {}
                // An undecodable page is as good as free.
                Ok(None) | Err(StoreError::SchemaViolation(_)) => {
                    free = free.or(Some(page));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((None, free))
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        for page in 0..self.page_count {
            match self.read_entry(page) {
                Ok(Some((k, v))) if k == key => return Ok(Some(v)),
                Ok(_) | Err(StoreError::SchemaViolation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Insert or replace `key`.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let encoded = postcard::to_allocvec(&PageEntry { key, value })
            .map_err(|e| StoreError::Write(format!("encoding `{key}`: {e}")))?;
        if encoded.len() > MAX_ENTRY_LEN {
            return Err(StoreError::RecordTooLarge {
                len: encoded.len(),
                capacity: MAX_ENTRY_LEN,
            });
        }

        let page = match self.locate(key)? {
            (Some(page), _) | (None, Some(page)) => page,
            (None, None) => {
                return Err(StoreError::Write(format!(
                    "no free page left for `{key}`"
                )));
            }
        };

        let mut block = Block::new();
        block.contents[0] = LIVE;
        block.contents[1..HEADER_LEN].copy_from_slice(&(encoded.len() as u16).to_le_bytes());
        block.contents[HEADER_LEN..HEADER_LEN + encoded.len()].copy_from_slice(&encoded);
        self.store_page(page, block)?;
        debug!("Stored `{}` on page {}", key, page);
        Ok(())
    }

    /// Remove `key`; removing an absent key is not an error.
    pub fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if let (Some(page), _) = self.locate(key)? {
            self.store_page(page, Block::new())?;
            debug!("Freed page {} (`{}`)", page, key);
        }
        Ok(())
    }

    /// Every readable entry in page order.
    pub fn entries(&mut self) -> Result<Vec<(String, String)>, StoreError> {
        let mut out = Vec::new();
        for page in 0..self.page_count {
            match self.read_entry(page) {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) | Err(StoreError::SchemaViolation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Error of [`MemoryBlockDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBlockError {
    OutOfRange,
    ReadRefused,
    WriteRefused,
}

/// RAM-backed block device for tests and simulations.
pub struct MemoryBlockDevice {
    blocks: RefCell<Vec<[u8; Block::LEN]>>,
    writes: Cell<usize>,
    fail_reads: Cell<bool>,
    fail_writes: Cell<bool>,
}

impl MemoryBlockDevice {
    /// A zero-filled device of `num_blocks` blocks
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: RefCell::new(vec![[0u8; Block::LEN]; num_blocks]),
            writes: Cell::new(0),
            fail_reads: Cell::new(false),
            fail_writes: Cell::new(false),
        }
    }

    /// Number of blocks written so far
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.set(fail);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Overwrite raw bytes of one block
    pub fn poke(&self, block: usize, offset: usize, bytes: &[u8]) {
        if let Some(target) = self.blocks.borrow_mut().get_mut(block) {
            target[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    type Error = MemoryBlockError;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        if self.fail_reads.get() {
            return Err(MemoryBlockError::ReadRefused);
        }
        let stored = self.blocks.borrow();
        for (i, block) in blocks.iter_mut().enumerate() {
            let source = stored
                .get(start_block_idx.0 as usize + i)
                .ok_or(MemoryBlockError::OutOfRange)?;
            block.contents.copy_from_slice(source);
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        if self.fail_writes.get() {
            return Err(MemoryBlockError::WriteRefused);
        }
        let mut stored = self.blocks.borrow_mut();
        for (i, block) in blocks.iter().enumerate() {
            let target = stored
                .get_mut(start_block_idx.0 as usize + i)
                .ok_or(MemoryBlockError::OutOfRange)?;
            target.copy_from_slice(&block.contents);
            self.writes.set(self.writes.get() + 1);
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.blocks.borrow().len() as u32))
    }
}

/// Stores each record field as its own string entry in a [`PagedKvStore`].
pub struct PagedKvBackend<D: BlockDevice> {
    store: PagedKvStore<D>,
}

impl<D: BlockDevice> PagedKvBackend<D> {
    pub fn new(store: PagedKvStore<D>) -> Self {
        Self { store }
    }

    /// Open the default-sized store at the start of `device`.
    pub fn open(device: D) -> Result<Self, StoreError> {
        PagedKvStore::open(device, 0, DEFAULT_PAGE_COUNT).map(Self::new)
    }

    pub fn store(&self) -> &PagedKvStore<D> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PagedKvStore<D> {
        &mut self.store
    }
}

impl<D: BlockDevice> Backend for PagedKvBackend<D> {
    fn name(&self) -> &'static str {
        "paged-kv"
    }

    fn try_load(&mut self) -> Result<StateRecord, StoreError> {
        let entries: BTreeMap<String, String> = self.store.entries()?.into_iter().collect();
        for key in FIELD_NAMES {
            if !entries.contains_key(key) {
                debug!("Paged store has no `{}` entry", key);
                return Err(StoreError::SchemaViolation("paged store is missing a field"));
            }
        }
        let field = |key: &str| entries.get(key).map(String::as_str).unwrap_or_default();

        Ok(StateRecord {
            hostname: record::parse_hostname(field("hostname"))?,
            indicator: Indicator::from_token_or_first(field("indicator")),
            last_save_time: time_codec::decode(field("last_save_time"))?,
            metric: record::parse_metric(field("metric"))?,
            ml_per_pulse: record::parse_ml_per_pulse(field("ml_per_pulse"))?,
            usage: record::parse_usage(field("usage"))?,
        })
    }

    fn write_record(&mut self, record: &StateRecord) -> Result<(), StoreError> {
        check_record(record)?;
        for (key, value) in record.entries() {
            self.store.insert(key, &value)?;
        }
        Ok(())
    }

    fn dump(&mut self) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect())
    }

    fn raw_edit(&mut self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        match value {
            Some(value) => self.store.insert(key, value),
            None => self.store.remove(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_secs;

    fn backend() -> PagedKvBackend<MemoryBlockDevice> {
        PagedKvBackend::open(MemoryBlockDevice::new(32)).unwrap()
    }

    #[test]
    fn open_checks_device_capacity() {
        assert!(matches!(
            PagedKvStore::open(MemoryBlockDevice::new(8), 0, DEFAULT_PAGE_COUNT),
            Err(StoreError::MediaUnavailable(_))
        ));
        assert!(PagedKvStore::open(MemoryBlockDevice::new(8), 4, 4).is_ok());
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut store = PagedKvStore::open(MemoryBlockDevice::new(4), 0, 4).unwrap();
        store.insert("usage", "1").unwrap();
        store.insert("metric", "True").unwrap();
        store.insert("usage", "2").unwrap();

        assert_eq!(store.get("usage").unwrap().as_deref(), Some("2"));
        assert_eq!(
            store.entries().unwrap(),
            vec![
                ("usage".to_string(), "2".to_string()),
                ("metric".to_string(), "True".to_string()),
            ]
        );
    }

    #[test]
    fn full_store_refuses_new_keys() {
        let mut store = PagedKvStore::open(MemoryBlockDevice::new(2), 0, 2).unwrap();
        store.insert("a", "1").unwrap();
        store.insert("b", "2").unwrap();
        assert!(matches!(store.insert("c", "3"), Err(StoreError::Write(_))));

        store.remove("a").unwrap();
        store.insert("c", "3").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn unreadable_page_is_an_error_not_a_missing_key() {
        let mut store = PagedKvStore::open(MemoryBlockDevice::new(8), 4, 4).unwrap();
        store.insert("usage", "9").unwrap();
        store.insert("metric", "True").unwrap();

        store.device().set_fail_reads(true);
        assert!(matches!(
            store.get("usage"),
            Err(StoreError::MediaUnavailable(_))
        ));
        assert!(matches!(
            store.get("hostname"),
            Err(StoreError::MediaUnavailable(_))
        ));

        store.device().set_fail_reads(false);
        assert_eq!(store.get("usage").unwrap().as_deref(), Some("9"));
    }

    #[test]
    fn oversized_value_is_refused() {
        let mut store = PagedKvStore::open(MemoryBlockDevice::new(1), 0, 1).unwrap();
        let huge = "x".repeat(PAGE_SIZE);
        assert!(matches!(
            store.insert("hostname", &huge),
            Err(StoreError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn record_round_trips_through_entries() {
        let mut backend = backend();
        let mut record = StateRecord {
            usage: 77,
            metric: false,
            ml_per_pulse: 0.875657,
            ..StateRecord::default()
        };
        backend.save(&mut record, from_unix_secs(1_700_000_000)).unwrap();

        assert_eq!(backend.try_load().unwrap(), record);
        let metric = backend.store_mut().get("metric").unwrap();
        assert_eq!(metric.as_deref(), Some("False"));
    }

    #[test]
    fn blank_device_loads_defaults() {
        let mut backend = backend();
        assert!(matches!(
            backend.try_load(),
            Err(StoreError::SchemaViolation(_))
        ));
        assert_eq!(backend.load(), StateRecord::default());
    }

    #[test]
    fn missing_or_bad_field_loads_defaults() {
        let mut backend = backend();
        backend.initialize(from_unix_secs(1_700_000_000)).unwrap();

        backend.raw_edit("usage", None).unwrap();
        assert_eq!(backend.load(), StateRecord::default());

        backend.raw_edit("usage", Some("-4")).unwrap();
        assert!(backend.try_load().is_err());

        backend.raw_edit("usage", Some("4")).unwrap();
        assert_eq!(backend.try_load().unwrap().usage, 4);
    }

    #[test]
    fn corrupt_page_is_skipped() {
        let mut backend = backend();
        backend.initialize(from_unix_secs(1_700_000_000)).unwrap();
        // live tag with a length running off the page
        backend.store().device().poke(0, 0, &[LIVE, 0xFF, 0xFF]);
        backend.store_mut().cached_page = None;

        assert_eq!(backend.dump().unwrap().len(), FIELD_NAMES.len() - 1);
        assert!(backend.try_load().is_err());
    }

    #[test]
    fn failed_write_surfaces_and_keeps_stamp() {
        let mut backend = backend();
        let mut record = StateRecord::default();
        backend.save(&mut record, from_unix_secs(1_000_000_000)).unwrap();

        backend.store().device().set_fail_writes(true);
        let stamp = record.last_save_time;
        assert!(backend.save(&mut record, from_unix_secs(1_000_000_600)).is_err());
        assert_eq!(record.last_save_time, stamp);
    }

    #[test]
    fn dump_lists_raw_entries() {
        let mut backend = backend();
        backend.initialize(from_unix_secs(1_700_000_000)).unwrap();
        backend.raw_edit("firmware", Some("2.1")).unwrap();

        let dump = backend.dump().unwrap();
        assert!(dump.contains(&Entry::new("metric", "True")));
        assert!(dump.contains(&Entry::new("firmware", "2.1")));
        // extra keys do not break loading
        assert!(backend.try_load().is_ok());
    }
}
