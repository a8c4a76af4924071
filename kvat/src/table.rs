// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements I/O for the index header and the entry table.
//!
//! The storage port moves word-aligned regions; the logical
//! records are byte-packed. The engine's scratch buffer bridges
//! the two: every call serialises into (or parses out of) the
//! scratch and performs a single aligned transfer. Port failures
//! surface as [`Error::StorageFault`]; the directory operations
//! decide which of those amount to a table fault.

use crate::index::{Entry, Index, ENTRY_LEN, INDEX_LEN};
use crate::{Error, Kvat};

impl Kvat {
    /// Returns the storage address of entry `i`.
    ///
    fn entry_address(&self, i: u8) -> usize {
        self.config.index_start + INDEX_LEN + (i as usize) * ENTRY_LEN
    }

    /// Reads the index header from storage.
    ///
    pub(crate) fn read_index(&mut self) -> Result<Index, Error> {
        let scratch = &mut self.scratch[..INDEX_LEN];
        self.device
            .read(self.config.index_start, scratch)
            .map_err(|_| Error::StorageFault)?;

        let mut buf = [0u8; INDEX_LEN];
        buf.copy_from_slice(scratch);

        Ok(Index::from_bytes(&buf))
    }

    /// Writes the index header to storage.
    ///
    pub(crate) fn write_index(&mut self, index: &Index) -> Result<(), Error> {
        self.scratch[..INDEX_LEN].copy_from_slice(&index.to_bytes());
        self.device
            .program(self.config.index_start, &self.scratch[..INDEX_LEN])
            .map_err(|_| Error::StorageFault)
    }

    /// Reads entry `i` from the entry table.
    ///
    pub(crate) fn read_entry(&mut self, i: u8) -> Result<Entry, Error> {
        let addr = self.entry_address(i);
        let scratch = &mut self.scratch[..ENTRY_LEN];
        self.device
            .read(addr, scratch)
            .map_err(|_| Error::StorageFault)?;

        let mut buf = [0u8; ENTRY_LEN];
        buf.copy_from_slice(scratch);

        Ok(Entry::from_bytes(&buf))
    }

    /// Writes entry `i` to the entry table.
    ///
    pub(crate) fn write_entry(&mut self, i: u8, entry: &Entry) -> Result<(), Error> {
        let addr = self.entry_address(i);
        self.scratch[..ENTRY_LEN].copy_from_slice(&entry.to_bytes());
        self.device
            .program(addr, &self.scratch[..ENTRY_LEN])
            .map_err(|_| Error::StorageFault)
    }

    /// Returns the position of the first entry that is neither
    /// active nor mid-edit, or None if the table is full.
    ///
    /// Entry 0 is reserved and never returned.
    ///
    pub(crate) fn empty_entry_number(&mut self) -> Result<Option<u8>, Error> {
        for i in 1..self.config.page_count {
            let entry = self.read_entry(i)?;
            if !entry.is_occupied() {
                return Ok(Some(i));
            }
        }

        Ok(None)
    }
}
