// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the page occupancy record.
//!
//! The record is a process-memory bitmap with one bit per page:
//! set means used. It is cache, not truth. Truth lives in the
//! entry table, and [`rebuild_record`](Kvat::rebuild_record)
//! re-derives the record from the table at init by walking every
//! active entry's chains. Page 0 is reserved and always marked
//! used, which lets a page number of 0 double as "none"
//! throughout the engine.

use crate::index::Metadata;
use crate::{Error, Kvat};
use bitmap_index::Bitmap;
use log::debug;

/// Tracks which pages are in use.
///
pub(crate) struct PageRecord {
    bits: Bitmap,
}

impl PageRecord {
    /// Returns a record of `page_count` pages with only the
    /// reserved page 0 marked used.
    ///
    pub fn new(page_count: u8) -> Self {
        let mut record = PageRecord {
            bits: Bitmap::new_unset(page_count as usize),
        };
        record.reset();

        record
    }

    /// Marks every page free again, except the reserved page 0.
    ///
    pub fn reset(&mut self) {
        self.bits = Bitmap::new_unset(self.bits.len());
        self.bits.set(0);
    }

    /// Marks page `n` used or free.
    ///
    pub fn mark(&mut self, n: u8, used: bool) {
        if used {
            self.bits.set(n as usize);
        } else {
            self.bits.unset(n as usize);
        }
    }

    /// Returns whether page `n` is marked used.
    ///
    pub fn is_used(&self, n: u8) -> bool {
        self.bits.get(n as usize)
    }

    /// Returns the first free page, or None if every page is in
    /// use. If `take` is set, the returned page is marked used in
    /// the same step.
    ///
    /// Page 0 is permanently marked, so the result is never 0.
    ///
    pub fn find_free(&mut self, take: bool) -> Option<u8> {
        let n = self.bits.next_unset()?;
        if take {
            self.bits.set(n);
        }

        Some(n as u8)
    }

    /// Returns the number of pages marked used, including the
    /// reserved page 0.
    ///
    pub fn used_count(&self) -> usize {
        self.bits.count_set()
    }

    /// Returns a copy of the underlying bitmap.
    ///
    pub fn snapshot(&self) -> Bitmap {
        self.bits.clone()
    }
}

impl Kvat {
    /// Walks the chain starting at `start`, marking every visited
    /// page used or free in the record.
    ///
    /// The walk is bounded by the page count, so a corrupt chain
    /// with a cycle or a wild link byte cannot loop or run off the
    /// record.
    ///
    pub(crate) fn follow_chain_and_mark(
        &mut self,
        start: u8,
        used: bool,
        multiple: bool,
    ) -> Result<(), Error> {
        if !self.valid_page(start) {
            return Ok(());
        }

        self.record.mark(start, used);
        if !multiple {
            return Ok(());
        }

        let mut page = start;
        for _ in 1..self.config.page_count {
            let next = self.read_next(page)?;
            if !self.valid_page(next) {
                break;
            }

            self.record.mark(next, used);
            page = next;
        }

        Ok(())
    }

    /// Rebuilds the record from the entry table: every page
    /// reachable from an active entry's key or value chain is
    /// marked used, everything else is free.
    ///
    /// Entries left mid-edit by an interrupted save (OPEN set,
    /// ACTIVE never set) are reset to empty here, so the slot and
    /// the pages it had claimed become available again.
    ///
    pub(crate) fn rebuild_record(&mut self) -> Result<(), Error> {
        self.record.reset();

        let mut reclaimed = 0usize;
        for i in 1..self.config.page_count {
            let entry = self.read_entry(i).map_err(|_| Error::RecordFault)?;
            if entry.is_active() {
                let key_multiple = entry.metadata.contains(Metadata::KEY_MULTIPLE);
                self.follow_chain_and_mark(entry.key_page, true, key_multiple)
                    .map_err(|_| Error::RecordFault)?;

                let value_multiple = entry.metadata.contains(Metadata::VALUE_MULTIPLE);
                self.follow_chain_and_mark(entry.value_page, true, value_multiple)
                    .map_err(|_| Error::RecordFault)?;
            } else if entry.is_occupied() {
                // OPEN without ACTIVE: an interrupted edit.
                self.write_entry(i, &crate::index::Entry::empty())
                    .map_err(|_| Error::RecordFault)?;
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!("kvat: reclaimed {} interrupted entries", reclaimed);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn find_free_skips_page_zero() {
        let mut record = PageRecord::new(4);
        assert!(record.is_used(0));
        assert_eq!(record.find_free(false), Some(1));
        assert_eq!(record.find_free(true), Some(1));
        assert_eq!(record.find_free(true), Some(2));
        assert_eq!(record.find_free(true), Some(3));
        assert_eq!(record.find_free(true), None);
        assert_eq!(record.used_count(), 4);
    }

    #[test]
    fn mark_and_reset() {
        let mut record = PageRecord::new(8);
        record.mark(5, true);
        assert!(record.is_used(5));

        record.mark(5, false);
        assert!(!record.is_used(5));

        record.mark(3, true);
        record.reset();
        assert!(!record.is_used(3));
        assert!(record.is_used(0));
        assert_eq!(record.used_count(), 1);
    }
}
