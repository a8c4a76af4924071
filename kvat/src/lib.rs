// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements KVAT, a dictionary-like file system for a small
//! byte-addressable non-volatile medium, such as an internal
//! EEPROM.
//!
//! Keys are human-readable strings and values are arbitrary byte
//! blobs. On storage, the store is an index header, a table of
//! 4-byte entries, and a region of fixed-size pages; each entry
//! binds a key chain and a value chain, where a chain is a list of
//! pages linked through a one-byte next-page field. A
//! process-memory occupancy record, rebuilt from the entry table
//! at init, locates free pages without rescanning storage.
//!
//! The engine is a handle, [`Kvat`], owning its storage device
//! exclusively. It is single-threaded and non-reentrant; callers
//! that share a handle must serialise access themselves. All
//! fallible operations return an [`Error`]; nothing is retried and
//! nothing is logged on the operation paths, so callers decide
//! visibility.
//!
//! ```ignore
//! let device = storage::memory::InMemory::new(4096);
//! let mut kvat = Kvat::new(Box::new(device), Config::default());
//! kvat.init()?;
//! kvat.save_string("greeting", "hello")?;
//! let value = kvat.retrieve_string_by_allocation("greeting")?;
//! ```

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use log::{debug, warn};
use storage::{Operations, Storage, WORD_SIZE};

mod chain;
mod index;
mod paging;
mod record;
mod table;

pub use crate::index::FORMAT_ID;

use crate::index::{Entry, Index, Metadata, ENTRY_LEN, INDEX_LEN};
use crate::record::PageRecord;

/// The value a search cursor must be initialised with before the
/// first call to [`Kvat::search`].
///
pub const INITIAL_SEARCH_ID: u8 = 1;

/// The size of the stack buffer used to fetch candidate keys
/// during lookup. Keys that fit (the common case) cost no heap
/// traffic to compare.
///
const STRING_KEY_STD_LEN: usize = 16;

/// The set of errors reported by the engine.
///
/// The numerical values are stable; 0 is reserved for "no error"
/// and is expressed as `Ok(())`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The operation failed in a way the engine cannot attribute.
    /// Reported only when restoring the old key after a failed
    /// rename also fails.
    Unknown = 1,

    /// A precondition was violated: the engine is not initialised,
    /// it is already initialised, the configuration is invalid, or
    /// a key is empty. Never a sign of data corruption.
    InvalidAccess = 2,

    /// The requested key is not present.
    NotFound = 3,

    /// A chain could not be fetched from storage.
    FetchFault = 4,

    /// No free entry slot, or not enough free pages for the data.
    InsufficientSpace = 5,

    /// The storage device failed, or cannot hold the configured
    /// page region.
    StorageFault = 6,

    /// A heap allocation failed. The engine pre-allocates its
    /// scratch storage, so current code paths do not produce this
    /// value; it is retained so the numbering stays stable.
    HeapError = 7,

    /// The page occupancy record could not be rebuilt during
    /// init.
    RecordFault = 8,

    /// A read or write of the entry table failed. If chains had
    /// already been rewritten, the engine disables itself, and
    /// every call reports [`InvalidAccess`](Error::InvalidAccess)
    /// until it is initialised again.
    TableError = 9,

    /// The new name passed to a rename is already taken.
    KeyDuplicate = 10,
}

impl Error {
    /// Returns the error with the given numerical value or None.
    ///
    pub fn from_usize(num: usize) -> Option<Self> {
        match num {
            1 => Some(Self::Unknown),
            2 => Some(Self::InvalidAccess),
            3 => Some(Self::NotFound),
            4 => Some(Self::FetchFault),
            5 => Some(Self::InsufficientSpace),
            6 => Some(Self::StorageFault),
            7 => Some(Self::HeapError),
            8 => Some(Self::RecordFault),
            9 => Some(Self::TableError),
            10 => Some(Self::KeyDuplicate),
            _ => None,
        }
    }
}

/// The default page size in bytes.
///
pub const DEFAULT_PAGE_SIZE: usize = 32;

/// The default page count, including the reserved page 0.
///
pub const DEFAULT_PAGE_COUNT: u8 = 128;

/// The default storage address of the index header.
///
pub const DEFAULT_INDEX_START: usize = 0;

/// The store geometry a [`Kvat`] handle is built with.
///
/// The geometry is part of the format identity: a store whose
/// header records different values is treated as unformatted.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    page_size: usize,
    page_count: u8,
    index_start: usize,
}

impl Config {
    /// Returns a validated configuration.
    ///
    /// `page_size` must be a multiple of the transfer word size,
    /// at most 256 bytes; `page_count` includes the reserved page
    /// 0 and must leave at least one usable page; `index_start`
    /// must be word-aligned.
    ///
    pub fn new(page_size: usize, page_count: u8, index_start: usize) -> Result<Config, Error> {
        if page_size == 0 || page_size % WORD_SIZE != 0 || page_size > 256 {
            return Err(Error::InvalidAccess);
        }

        if page_count < 2 {
            return Err(Error::InvalidAccess);
        }

        if index_start % WORD_SIZE != 0 {
            return Err(Error::InvalidAccess);
        }

        Ok(Config {
            page_size,
            page_count,
            index_start,
        })
    }

    /// Returns the page size in bytes.
    ///
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the page count, including the reserved page 0.
    ///
    pub fn page_count(&self) -> u8 {
        self.page_count
    }

    /// Returns the storage address of the index header.
    ///
    pub fn index_start(&self) -> usize {
        self.index_start
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: DEFAULT_PAGE_SIZE,
            page_count: DEFAULT_PAGE_COUNT,
            index_start: DEFAULT_INDEX_START,
        }
    }
}

/// Returns the key or value bytes with a NUL terminator appended,
/// the shape strings take on storage.
///
fn nul_terminated(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);

    buf
}

/// Compares a key against a fetched NUL-terminated candidate.
/// Returns the candidate's length on a match: an exact match, or
/// a prefix match when `partial` is set.
///
fn key_matches(key: &[u8], candidate: &[u8], partial: bool) -> Option<usize> {
    let len = candidate
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(candidate.len());

    if key.len() > len || &candidate[..key.len()] != key {
        return None;
    }

    if !partial && key.len() != len {
        return None;
    }

    Some(len)
}

/// A KVAT engine handle.
///
/// The handle owns its storage device for its whole lifetime.
/// Every public operation fails with
/// [`Error::InvalidAccess`] until [`init`](Kvat::init) has
/// succeeded.
///
pub struct Kvat {
    // The storage port; exclusively owned by the engine.
    device: Box<dyn Storage + Send>,

    // The geometry the handle was built with.
    config: Config,

    // The index record the geometry serialises to.
    index: Index,

    // The page occupancy cache. Truth lives in the entry table;
    // this is rebuilt from it at init.
    record: PageRecord,

    // One aligned scratch buffer, reused by every transfer.
    scratch: Vec<u8>,

    initialized: bool,
}

impl Kvat {
    /// Returns an engine over the given device. No storage is
    /// touched until [`init`](Kvat::init).
    ///
    pub fn new(device: Box<dyn Storage + Send>, config: Config) -> Self {
        let index = Index {
            format_id: FORMAT_ID,
            page_size: config.page_size as u32,
            page_count: config.page_count,
            page_begin_address: (config.index_start
                + INDEX_LEN
                + ENTRY_LEN * config.page_count as usize) as u32,
        };

        Kvat {
            index,
            record: PageRecord::new(config.page_count),
            scratch: vec![0u8; core::cmp::max(config.page_size, INDEX_LEN)],
            device,
            config,
            initialized: false,
        }
    }

    /// Returns whether the engine is initialised and serving
    /// requests.
    ///
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Brings the engine up: initialises the device, adopts the
    /// store if its header matches the configured geometry or
    /// formats it otherwise, and rebuilds the page occupancy
    /// record from the entry table.
    ///
    pub fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::InvalidAccess);
        }

        self.device.init().map_err(|_| Error::StorageFault)?;
        if !self
            .device
            .operations()
            .contains(Operations::READ | Operations::PROGRAM)
        {
            return Err(Error::StorageFault);
        }

        let end = self.index.page_begin_address as usize
            + self.config.page_count as usize * self.config.page_size;
        if end > self.device.capacity() {
            return Err(Error::StorageFault);
        }

        let stored = self.read_index()?;
        if stored != self.index {
            debug!("kvat: store is unformatted or foreign, formatting");
            self.format()?;
        }

        self.rebuild_record()?;
        self.initialized = true;
        debug!(
            "kvat: initialised, {} of {} pages in use",
            self.record.used_count(),
            self.config.page_count
        );

        Ok(())
    }

    /// Formats the store: writes the index header, then zeroes
    /// every entry in the table.
    ///
    fn format(&mut self) -> Result<(), Error> {
        let index = self.index;
        self.write_index(&index)?;

        for i in 0..self.config.page_count {
            self.write_entry(i, &Entry::empty())
                .map_err(|_| Error::TableError)?;
        }

        Ok(())
    }

    /// Disables the engine after an unrecoverable fault. Every
    /// further public call fails with
    /// [`Error::InvalidAccess`] until [`init`](Kvat::init) runs
    /// again.
    ///
    fn deinit(&mut self) {
        self.initialized = false;
        warn!("kvat: engine disabled after an unrecoverable table fault");
    }

    /// Checks the preconditions shared by the public operations.
    ///
    fn guard(&self, key: &str) -> Result<(), Error> {
        if !self.initialized || key.is_empty() {
            return Err(Error::InvalidAccess);
        }

        Ok(())
    }

    /// Fetches the key of `entry` and compares it against `key`,
    /// returning the stored key's length on a match.
    ///
    /// Keys no longer than [`STRING_KEY_STD_LEN`] are compared in
    /// a stack buffer; longer keys fall back to a heap fetch.
    ///
    fn entry_key_matches(
        &mut self,
        entry: &Entry,
        key: &[u8],
        partial: bool,
    ) -> Result<Option<usize>, Error> {
        let multiple = entry.metadata.contains(Metadata::KEY_MULTIPLE);

        let mut stack_key = [0u8; STRING_KEY_STD_LEN];
        let capacity = self
            .fetch_chain_into(entry.key_page, multiple, &mut stack_key, false)
            .map_err(|_| Error::TableError)?;
        if capacity <= STRING_KEY_STD_LEN {
            return Ok(key_matches(key, &stack_key[..capacity], partial));
        }

        let (buf, capacity) = self
            .fetch_chain_alloc(entry.key_page, multiple)
            .map_err(|_| Error::TableError)?;

        Ok(key_matches(key, &buf[..capacity], partial))
    }

    /// Scans the entry table for an active entry whose key
    /// matches, starting at position `start`. Returns the entry
    /// position, or None.
    ///
    fn lookup_by_key(&mut self, key: &[u8], partial: bool, start: u8) -> Result<Option<u8>, Error> {
        for i in start.max(1)..self.config.page_count {
            let entry = self.read_entry(i).map_err(|_| Error::TableError)?;
            if !entry.is_active() {
                continue;
            }

            if self.entry_key_matches(&entry, key, partial)?.is_some() {
                return Ok(Some(i));
            }
        }

        Ok(None)
    }

    /// Saves a value under a key, overwriting any previous value.
    ///
    /// An overwrite reuses the old value's pages, growing or
    /// shrinking the chain as needed; the key chain is left
    /// untouched.
    ///
    pub fn save_value(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.guard(key)?;

        let key_bytes = key.as_bytes();
        let found = self.lookup_by_key(key_bytes, false, 1)?;
        let (number, mut entry) = match found {
            Some(i) => (i, self.read_entry(i).map_err(|_| Error::TableError)?),
            None => match self.empty_entry_number().map_err(|_| Error::TableError)? {
                Some(i) => (i, Entry::empty()),
                None => return Err(Error::InsufficientSpace),
            },
        };
        let overwrite = found.is_some();

        // Commit the intent to edit before any chain moves.
        entry.metadata.insert(Metadata::OPEN);
        self.write_entry(number, &entry)
            .map_err(|_| Error::TableError)?;

        if !overwrite {
            let written = match self.write_chain(&nul_terminated(key), 0, false) {
                Ok(written) => written,
                Err(_) => {
                    // The fresh slot holds nothing yet; give it
                    // back so the record stays truthful.
                    let _ = self.write_entry(number, &Entry::empty());
                    return Err(Error::InsufficientSpace);
                }
            };
            entry.key_page = written.first_page;
            entry.metadata.set(Metadata::KEY_MULTIPLE, written.multiple);
        }

        let (reuse, reuse_multiple) = if overwrite {
            (
                entry.value_page,
                entry.metadata.contains(Metadata::VALUE_MULTIPLE),
            )
        } else {
            (0, false)
        };

        let written = match self.write_chain(value, reuse, reuse_multiple) {
            Ok(written) => written,
            Err(_) => {
                if !overwrite {
                    let key_multiple = entry.metadata.contains(Metadata::KEY_MULTIPLE);
                    let _ = self.follow_chain_and_mark(entry.key_page, false, key_multiple);
                    let _ = self.write_entry(number, &Entry::empty());
                }

                return Err(Error::InsufficientSpace);
            }
        };

        // The key chain was not touched on overwrite; keep its
        // shape. The key format bits stay zero: NUL-terminated
        // string.
        let mut metadata = Metadata::ACTIVE;
        metadata.set(
            Metadata::KEY_MULTIPLE,
            entry.metadata.contains(Metadata::KEY_MULTIPLE),
        );
        metadata.set(Metadata::VALUE_MULTIPLE, written.multiple);

        entry.metadata = metadata;
        entry.value_page = written.first_page;
        entry.remains = written.remains;

        if self.write_entry(number, &entry).is_err() {
            // The table no longer matches the chains on storage.
            self.deinit();
            return Err(Error::TableError);
        }

        Ok(())
    }

    /// Saves a string value under a key. The value is stored with
    /// its NUL terminator, so it round-trips as a C string.
    ///
    pub fn save_string(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.guard(key)?;
        self.save_value(key, &nul_terminated(value))
    }

    /// Locates the entry holding `key`, exactly.
    ///
    fn locate(&mut self, key: &str) -> Result<Entry, Error> {
        self.guard(key)?;

        let number = self
            .lookup_by_key(key.as_bytes(), false, 1)?
            .ok_or(Error::NotFound)?;

        self.read_entry(number).map_err(|_| Error::TableError)
    }

    /// Retrieves the value stored under `key` into `buf`,
    /// returning the value's actual size.
    ///
    /// If `buf` is smaller than the value, only a prefix is
    /// copied; the returned size still describes the whole value.
    ///
    pub fn retrieve_value_by_buffer(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, Error> {
        let entry = self.locate(key)?;
        let multiple = entry.metadata.contains(Metadata::VALUE_MULTIPLE);
        let capacity = self
            .fetch_chain_into(entry.value_page, multiple, buf, true)
            .map_err(|_| Error::FetchFault)?;

        Ok(capacity.saturating_sub(entry.remains as usize))
    }

    /// Retrieves the value stored under `key` as an owned buffer.
    ///
    pub fn retrieve_value_by_allocation(&mut self, key: &str) -> Result<Vec<u8>, Error> {
        let entry = self.locate(key)?;
        let multiple = entry.metadata.contains(Metadata::VALUE_MULTIPLE);
        let (mut buf, capacity) = self
            .fetch_chain_alloc(entry.value_page, multiple)
            .map_err(|_| Error::FetchFault)?;

        buf.truncate(capacity.saturating_sub(entry.remains as usize));

        Ok(buf)
    }

    /// Retrieves a string value into `buf`, returning the string
    /// length (the position of the NUL terminator, if present
    /// within the copied bytes).
    ///
    pub fn retrieve_string_by_buffer(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, Error> {
        let size = self.retrieve_value_by_buffer(key, buf)?;
        let copied = min(size, buf.len());

        Ok(buf[..copied]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(copied))
    }

    /// Retrieves a string value as an owned string, with the
    /// stored NUL terminator stripped.
    ///
    pub fn retrieve_string_by_allocation(&mut self, key: &str) -> Result<String, Error> {
        let mut bytes = self.retrieve_value_by_allocation(key)?;
        if let Some(n) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(n);
        }

        String::from_utf8(bytes).map_err(|_| Error::FetchFault)
    }

    /// Renames `current` to `new`, reusing the old key's chain.
    /// The value is untouched.
    ///
    pub fn change_key(&mut self, current: &str, new: &str) -> Result<(), Error> {
        self.guard(current)?;
        if new.is_empty() {
            return Err(Error::InvalidAccess);
        }

        let number = self
            .lookup_by_key(current.as_bytes(), false, 1)?
            .ok_or(Error::NotFound)?;
        if self.lookup_by_key(new.as_bytes(), false, 1)?.is_some() {
            return Err(Error::KeyDuplicate);
        }

        let mut entry = self.read_entry(number).map_err(|_| Error::TableError)?;
        let key_multiple = entry.metadata.contains(Metadata::KEY_MULTIPLE);

        let written = match self.write_chain(&nul_terminated(new), entry.key_page, key_multiple) {
            Ok(written) => written,
            Err(_) => {
                // Put the old key back through the same chain.
                match self.write_chain(&nul_terminated(current), entry.key_page, key_multiple) {
                    Ok(_) => return Err(Error::InsufficientSpace),
                    Err(_) => {
                        // The entry's chains can no longer be
                        // trusted; withdraw the entry entirely.
                        let _ = self.write_entry(number, &Entry::empty());
                        self.deinit();
                        return Err(Error::Unknown);
                    }
                }
            }
        };

        if written.multiple != key_multiple {
            entry.metadata.set(Metadata::KEY_MULTIPLE, written.multiple);
            entry.key_page = written.first_page;
            if self.write_entry(number, &entry).is_err() {
                self.deinit();
                return Err(Error::TableError);
            }
        }

        Ok(())
    }

    /// Deletes the value stored under `key`.
    ///
    /// The pages of both chains are released in the occupancy
    /// record only; their bytes stay put until a later write
    /// claims them.
    ///
    pub fn delete_value(&mut self, key: &str) -> Result<(), Error> {
        self.guard(key)?;

        let number = self
            .lookup_by_key(key.as_bytes(), false, 1)?
            .ok_or(Error::NotFound)?;
        let entry = self.read_entry(number).map_err(|_| Error::TableError)?;

        let key_multiple = entry.metadata.contains(Metadata::KEY_MULTIPLE);
        let value_multiple = entry.metadata.contains(Metadata::VALUE_MULTIPLE);
        if self
            .follow_chain_and_mark(entry.key_page, false, key_multiple)
            .and_then(|_| self.follow_chain_and_mark(entry.value_page, false, value_multiple))
            .is_err()
        {
            // Some pages may already be released while the entry
            // still claims them; stop before they can be handed
            // out again.
            self.deinit();
            return Err(Error::TableError);
        }

        if self.write_entry(number, &Entry::empty()).is_err() {
            self.deinit();
            return Err(Error::TableError);
        }

        Ok(())
    }

    /// Finds the next key starting with `prefix`, scanning entry
    /// positions from `search_id` upward.
    ///
    /// On a hit the key is copied into `key_buf` (trimmed to the
    /// buffer if needed), `search_id` becomes the next position to
    /// scan, and the stored key's length is returned. Initialise
    /// the cursor with [`INITIAL_SEARCH_ID`]; repeated calls walk
    /// all matches in entry-position order, then report
    /// [`Error::NotFound`].
    ///
    pub fn search(
        &mut self,
        prefix: &str,
        search_id: &mut u8,
        key_buf: &mut [u8],
    ) -> Result<usize, Error> {
        if !self.initialized {
            return Err(Error::InvalidAccess);
        }

        let prefix_bytes = prefix.as_bytes();
        for i in (*search_id).max(INITIAL_SEARCH_ID)..self.config.page_count {
            let entry = self.read_entry(i).map_err(|_| Error::TableError)?;
            if !entry.is_active() {
                continue;
            }

            if let Some(key_len) = self.entry_key_matches(&entry, prefix_bytes, true)? {
                let multiple = entry.metadata.contains(Metadata::KEY_MULTIPLE);
                self.fetch_chain_into(entry.key_page, multiple, key_buf, true)
                    .map_err(|_| Error::FetchFault)?;

                *search_id = i + 1;
                return Ok(min(key_len, key_buf.len()));
            }
        }

        Err(Error::NotFound)
    }
}
