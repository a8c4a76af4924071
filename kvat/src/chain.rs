// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements chain I/O: assembling the bytes of a page chain
//! into a buffer, and writing a buffer out as a page chain.
//!
//! Writing is where the engine earns its keep. An overwrite hands
//! the old value's chain to [`write_chain`](Kvat::write_chain) as
//! a reuse chain: the new data flows through the old pages first,
//! growing with fresh pages from the occupancy record or shrinking
//! by releasing the surplus tail, so an overwrite neither leaks
//! pages nor passes through a deleted intermediate state. If the
//! record runs out of pages mid-write, the newly taken pages are
//! returned, the surviving prefix of the reuse chain is
//! re-terminated, and the unreachable remainder is released, so
//! the record keeps matching what a rebuild would derive.

use crate::{Error, Kvat};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;

/// Describes a chain produced by [`Kvat::write_chain`].
///
#[derive(Debug)]
pub(crate) struct ChainWrite {
    /// The first page of the chain.
    pub first_page: u8,

    /// Whether the chain spans multiple pages (and so spends its
    /// first byte per page on a link).
    pub multiple: bool,

    /// Trailing unused payload bytes in the last page.
    pub remains: u8,
}

impl Kvat {
    /// Returns the usable payload bytes per page for a chain of
    /// the given shape.
    ///
    pub(crate) fn payload_per_page(&self, multiple: bool) -> usize {
        self.config.page_size - usize::from(multiple)
    }

    /// Returns the number of pages in the chain starting at
    /// `start`, bounded by the page count so a corrupt chain
    /// cannot loop.
    ///
    pub(crate) fn chain_pages(&mut self, start: u8, multiple: bool) -> Result<usize, Error> {
        if !self.valid_page(start) {
            return Ok(0);
        }

        if !multiple {
            return Ok(1);
        }

        let mut pages = 1usize;
        let mut page = start;
        while pages < self.config.page_count as usize {
            let next = self.read_next(page)?;
            if !self.valid_page(next) {
                break;
            }

            pages += 1;
            page = next;
        }

        Ok(pages)
    }

    /// Copies the chain starting at `start` into `dst`, returning
    /// the chain's payload capacity in bytes.
    ///
    /// If `dst` is smaller than the chain and `force` is clear,
    /// nothing is copied; the caller can inspect the returned
    /// capacity and retry with a larger buffer. With `force` set
    /// the traversal is trimmed to `dst.len()` bytes and the last
    /// page visited is copied partially.
    ///
    pub(crate) fn fetch_chain_into(
        &mut self,
        start: u8,
        multiple: bool,
        dst: &mut [u8],
        force: bool,
    ) -> Result<usize, Error> {
        let payload = self.payload_per_page(multiple);
        let capacity = self.chain_pages(start, multiple)? * payload;
        if capacity == 0 {
            return Ok(0);
        }

        if dst.len() < capacity && !force {
            return Ok(capacity);
        }

        let mut remaining = min(dst.len(), capacity);
        let mut offset = 0;
        let mut page = start;
        while remaining > 0 {
            let take = min(payload, remaining);
            let limit = if multiple { take + 1 } else { take };
            let data = self.read_page(page, limit)?;
            let (next, bytes) = if multiple {
                (data[0], &data[1..])
            } else {
                (0, data)
            };

            dst[offset..offset + take].copy_from_slice(bytes);
            offset += take;
            remaining -= take;

            if !self.valid_page(next) {
                break;
            }

            page = next;
        }

        Ok(capacity)
    }

    /// Copies the chain starting at `start` into a fresh buffer
    /// sized one past the chain's capacity, so the final byte is
    /// always NUL. Returns the buffer and the capacity.
    ///
    /// The guard byte keeps a NUL-terminator scan inside the
    /// buffer even when a stored string is corrupt.
    ///
    pub(crate) fn fetch_chain_alloc(
        &mut self,
        start: u8,
        multiple: bool,
    ) -> Result<(Vec<u8>, usize), Error> {
        let payload = self.payload_per_page(multiple);
        let capacity = self.chain_pages(start, multiple)? * payload;

        let mut buf = vec![0u8; capacity + 1];
        self.fetch_chain_into(start, multiple, &mut buf[..capacity], true)?;

        Ok((buf, capacity))
    }

    /// Writes `data` as a page chain, reusing the chain starting
    /// at `reuse_start` (shaped by `reuse_multiple`) page by page
    /// before taking fresh pages from the record.
    ///
    /// On success the surplus of the reuse chain, if any, has been
    /// released. On failure every fresh page taken by this call
    /// has been returned to the record and the surviving prefix of
    /// the reuse chain has been re-terminated.
    ///
    pub(crate) fn write_chain(
        &mut self,
        data: &[u8],
        reuse_start: u8,
        reuse_multiple: bool,
    ) -> Result<ChainWrite, Error> {
        let size = data.len();
        let multiple = size > self.config.page_size;
        let payload = self.payload_per_page(multiple);
        let pages_needed = if multiple {
            (size + payload - 1) / payload
        } else {
            1
        };

        // Page 0 is reserved, so no chain can span every page.
        if pages_needed >= self.config.page_count as usize {
            return Err(Error::InsufficientSpace);
        }

        let reuse_start = if self.valid_page(reuse_start) {
            reuse_start
        } else {
            0
        };

        // The next unconsumed page of the reuse chain, and the
        // iteration at which the reuse chain went dry.
        let mut reuse_next = reuse_start;
        let mut dry_i: Option<usize> = if reuse_start == 0 { Some(0) } else { None };

        let mut pages_used: Vec<u8> = Vec::with_capacity(pages_needed);
        let mut cur = if reuse_start != 0 {
            reuse_start
        } else {
            match self.record.find_free(true) {
                Some(page) => page,
                None => return Err(Error::InsufficientSpace),
            }
        };

        for i in 0..pages_needed {
            pages_used.push(cur);

            // If cur came from the reuse chain, advance the reuse
            // cursor now: cur's old link byte is about to be
            // overwritten. A single-page reuse chain has no link
            // byte and is spent after its one page.
            if dry_i.map_or(true, |dry| i < dry) {
                reuse_next = if !reuse_multiple {
                    0
                } else {
                    match self.read_next(cur) {
                        Ok(next) if self.valid_page(next) => next,
                        Ok(_) => 0,
                        Err(err) => {
                            self.unwind_chain_write(&pages_used, dry_i, 0, reuse_multiple);
                            return Err(err);
                        }
                    }
                };
            }

            // Pick the page the link byte will name: the next
            // reuse page while the old chain lasts, else a fresh
            // page.
            let next = if i + 1 < pages_needed {
                if reuse_next != 0 {
                    reuse_next
                } else {
                    if dry_i.is_none() {
                        dry_i = Some(i + 1);
                    }

                    match self.record.find_free(true) {
                        Some(page) => page,
                        None => {
                            self.unwind_chain_write(&pages_used, dry_i, 0, reuse_multiple);
                            return Err(Error::InsufficientSpace);
                        }
                    }
                }
            } else {
                0
            };

            let off = i * payload;
            let part = &data[off..min(off + payload, size)];
            let limit = if multiple {
                self.scratch[0] = next;
                self.scratch[1..1 + part.len()].copy_from_slice(part);
                1 + part.len()
            } else {
                self.scratch[..part.len()].copy_from_slice(part);
                part.len()
            };

            if limit > 0 {
                if let Err(err) = self.write_page(cur, limit) {
                    self.unwind_chain_write(&pages_used, dry_i, reuse_next, reuse_multiple);
                    return Err(err);
                }
            }

            cur = next;
        }

        // The new chain is shorter than the old one: release the
        // surplus.
        if reuse_next != 0 {
            self.follow_chain_and_mark(reuse_next, false, reuse_multiple)?;
        }

        let remains = if size % payload == 0 {
            0
        } else {
            (payload - size % payload) as u8
        };

        Ok(ChainWrite {
            first_page: pages_used[0],
            multiple,
            remains,
        })
    }

    /// Undoes a failed chain write. Fresh pages taken by the write
    /// are released; the surviving prefix of the reuse chain is
    /// re-terminated so no walk can reach the released pages; the
    /// unreachable remainder of the reuse chain is released too.
    ///
    /// Termination is skipped for a single-page reuse chain: it
    /// has no link byte to rewrite, and its metadata still
    /// describes it as link-free.
    ///
    fn unwind_chain_write(
        &mut self,
        pages_used: &[u8],
        dry_i: Option<usize>,
        reuse_next: u8,
        reuse_multiple: bool,
    ) {
        let dry = min(dry_i.unwrap_or(pages_used.len()), pages_used.len());
        for i in dry..pages_used.len() {
            self.record.mark(pages_used[i], false);
        }

        if dry > 0 && reuse_multiple {
            let _ = self.set_next(pages_used[dry - 1], 0);
        }

        if reuse_next != 0 {
            let _ = self.follow_chain_and_mark(reuse_next, false, reuse_multiple);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use alloc::boxed::Box;
    use storage::memory::InMemory;

    const PAGE_SIZE: usize = 12;
    const PAGE_COUNT: u8 = 8;

    fn engine() -> Kvat {
        let config = Config::new(PAGE_SIZE, PAGE_COUNT, 0).expect("config");
        Kvat::new(Box::new(InMemory::new(4096)), config)
    }

    #[test]
    fn single_page_round_trip() {
        let mut kvat = engine();

        let written = kvat.write_chain(b"hi\0", 0, false).expect("write");
        assert!(!written.multiple);
        assert_eq!(written.remains, 9);
        assert!(kvat.record.is_used(written.first_page));

        let mut buf = [0u8; PAGE_SIZE];
        let capacity = kvat
            .fetch_chain_into(written.first_page, false, &mut buf, false)
            .expect("fetch");
        assert_eq!(capacity, PAGE_SIZE);
        assert_eq!(&buf[..3], b"hi\0");
    }

    #[test]
    fn multi_page_round_trip() {
        let mut kvat = engine();

        // 21 bytes over 11-byte payloads: two pages, one byte
        // spare in the second.
        let data = b"0123456789ABCDEFGHIJ\0";
        let written = kvat.write_chain(data, 0, false).expect("write");
        assert!(written.multiple);
        assert_eq!(written.remains, 1);

        let (buf, capacity) = kvat
            .fetch_chain_alloc(written.first_page, true)
            .expect("fetch");
        assert_eq!(capacity, 22);
        assert_eq!(&buf[..data.len()], data);
        assert_eq!(buf[capacity], 0);
    }

    #[test]
    fn fetch_reports_capacity_without_copying() {
        let mut kvat = engine();

        let data = [7u8; 30];
        let written = kvat.write_chain(&data, 0, false).expect("write");

        let mut small = [0u8; 4];
        let capacity = kvat
            .fetch_chain_into(written.first_page, true, &mut small, false)
            .expect("fetch");
        assert_eq!(capacity, 33);
        assert_eq!(small, [0u8; 4]);

        // With force set the traversal is trimmed instead.
        let capacity = kvat
            .fetch_chain_into(written.first_page, true, &mut small, true)
            .expect("fetch");
        assert_eq!(capacity, 33);
        assert_eq!(small, [7u8; 4]);
    }

    #[test]
    fn overwrite_grows_through_reuse() {
        let mut kvat = engine();

        let old = kvat.write_chain(&[1u8; 20], 0, false).expect("write");
        let used_before = kvat.record.used_count();

        let new = kvat
            .write_chain(&[2u8; 40], old.first_page, old.multiple)
            .expect("overwrite");
        assert_eq!(new.first_page, old.first_page);
        assert!(new.multiple);

        // 40 bytes over 11-byte payloads is four pages; the old
        // chain contributed two.
        assert_eq!(kvat.record.used_count(), used_before + 2);

        let (buf, _) = kvat.fetch_chain_alloc(new.first_page, true).expect("fetch");
        assert_eq!(&buf[..40], &[2u8; 40]);
    }

    #[test]
    fn overwrite_shrinks_and_releases_tail() {
        let mut kvat = engine();

        let old = kvat.write_chain(&[1u8; 40], 0, false).expect("write");
        let used_before = kvat.record.used_count();

        let new = kvat
            .write_chain(&[2u8; 5], old.first_page, old.multiple)
            .expect("overwrite");
        assert_eq!(new.first_page, old.first_page);
        assert!(!new.multiple);

        // Three of the four old pages released.
        assert_eq!(kvat.record.used_count(), used_before - 3);

        let mut buf = [0u8; PAGE_SIZE];
        kvat.fetch_chain_into(new.first_page, false, &mut buf, false)
            .expect("fetch");
        assert_eq!(&buf[..5], &[2u8; 5]);
    }

    #[test]
    fn failed_write_returns_fresh_pages() {
        let mut kvat = engine();

        // Fill all seven usable pages but one.
        for _ in 0..6 {
            let _ = kvat.record.find_free(true);
        }
        let used_before = kvat.record.used_count();

        // Two pages needed, one available.
        let err = kvat.write_chain(&[9u8; 20], 0, false).unwrap_err();
        assert_eq!(err, Error::InsufficientSpace);
        assert_eq!(kvat.record.used_count(), used_before);
    }

    #[test]
    fn oversized_chain_fails_fast() {
        let mut kvat = engine();

        // Seven usable pages of 11 bytes each.
        let data = [0u8; 11 * 8];
        let err = kvat.write_chain(&data, 0, false).unwrap_err();
        assert_eq!(err, Error::InsufficientSpace);
        assert_eq!(kvat.record.used_count(), 1);
    }

    #[test]
    fn failed_grow_keeps_reuse_prefix_terminated() {
        let mut kvat = engine();

        let old = kvat.write_chain(&[1u8; 20], 0, false).expect("write");

        // Exhaust the record, then try to grow the two-page chain
        // to four pages.
        while kvat.record.find_free(true).is_some() {}
        let err = kvat
            .write_chain(&[2u8; 40], old.first_page, old.multiple)
            .unwrap_err();
        assert_eq!(err, Error::InsufficientSpace);

        // The old chain is still terminated: walking it visits at
        // most its old two pages.
        assert_eq!(kvat.chain_pages(old.first_page, true), Ok(2));
    }
}
