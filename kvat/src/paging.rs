// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the paging engine: page-number arithmetic and whole
//! or partial page transfers through the engine's scratch buffer.
//!
//! A page has no metadata of its own. In a multi-page chain the
//! first byte of each page is the link byte (the number of the
//! next page, 0 terminating the chain) and the remaining bytes are
//! payload; a single-page chain is payload from its first byte.
//! [`read_next`](Kvat::read_next) and [`set_next`](Kvat::set_next)
//! touch only the first word of a page, so rewriting a link leaves
//! the rest of the page intact on media that program whole words.

use crate::{Error, Kvat};
use storage::WORD_SIZE;

/// Rounds `len` up to the transfer alignment.
///
fn align_up(len: usize) -> usize {
    (len + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

impl Kvat {
    /// Returns the storage address of page `n`.
    ///
    /// Page 0 is reserved; it has no meaningful address.
    ///
    pub(crate) fn page_address(&self, n: u8) -> usize {
        debug_assert!(n != 0, "page 0 is reserved");
        self.index.page_begin_address as usize + (n as usize) * self.config.page_size
    }

    /// Returns whether `n` names a real, non-reserved page. Link
    /// bytes read from storage pass through this before the engine
    /// follows them; anything else terminates the walk.
    ///
    pub(crate) fn valid_page(&self, n: u8) -> bool {
        n != 0 && n < self.config.page_count
    }

    /// Reads the first `limit` bytes of page `n` into the scratch
    /// buffer, returning them as a slice.
    ///
    pub(crate) fn read_page(&mut self, n: u8, limit: usize) -> Result<&[u8], Error> {
        debug_assert!(limit <= self.config.page_size);

        let addr = self.page_address(n);
        let aligned = align_up(limit);
        self.device
            .read(addr, &mut self.scratch[..aligned])
            .map_err(|_| Error::StorageFault)?;

        Ok(&self.scratch[..limit])
    }

    /// Programs the first `limit` bytes of the scratch buffer into
    /// page `n`. Scratch bytes between `limit` and the alignment
    /// boundary are zeroed before the transfer; page bytes past
    /// the boundary keep their previous contents.
    ///
    pub(crate) fn write_page(&mut self, n: u8, limit: usize) -> Result<(), Error> {
        debug_assert!(limit <= self.config.page_size);

        let aligned = align_up(limit);
        for b in &mut self.scratch[limit..aligned] {
            *b = 0;
        }

        let addr = self.page_address(n);
        self.device
            .program(addr, &self.scratch[..aligned])
            .map_err(|_| Error::StorageFault)
    }

    /// Reads the link byte of page `n`.
    ///
    pub(crate) fn read_next(&mut self, n: u8) -> Result<u8, Error> {
        let addr = self.page_address(n);
        self.device
            .read(addr, &mut self.scratch[..WORD_SIZE])
            .map_err(|_| Error::StorageFault)?;

        Ok(self.scratch[0])
    }

    /// Rewrites the link byte of page `n` to `next`, preserving
    /// the rest of the page's first word.
    ///
    pub(crate) fn set_next(&mut self, n: u8, next: u8) -> Result<(), Error> {
        let addr = self.page_address(n);
        self.device
            .read(addr, &mut self.scratch[..WORD_SIZE])
            .map_err(|_| Error::StorageFault)?;

        self.scratch[0] = next;
        self.device
            .program(addr, &self.scratch[..WORD_SIZE])
            .map_err(|_| Error::StorageFault)
    }
}
