// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the on-storage records: the index header that
//! identifies a formatted store and the fixed-size entries that
//! bind a key chain and a value chain together.
//!
//! Both records are serialised explicitly, field by field, in
//! little-endian order. The byte layout is the format; nothing
//! here depends on how the compiler lays out the structs.

use bitflags::bitflags;

/// The persistence marker written into the index header.
///
/// A store whose header carries any other value is treated as
/// unformatted.
///
pub const FORMAT_ID: u16 = 0x5AFE;

/// The size of the serialised [`Index`] in bytes.
///
pub const INDEX_LEN: usize = 16;

/// The size of a serialised [`Entry`] in bytes.
///
pub const ENTRY_LEN: usize = 4;

bitflags! {
    /// The metadata byte of an [`Entry`].
    ///
    /// Bits 4 and 5 encode the key format; `00`, the only assigned
    /// encoding, is a NUL-terminated string. Bits 6 and 7 are
    /// reserved and must be zero.
    ///
    pub struct Metadata: u8 {
        /// The entry points to valid chains.
        const ACTIVE = 1 << 0;

        /// The entry is mid-edit. Readers treat the slot as
        /// occupied but not yet live.
        const OPEN = 1 << 1;

        /// The key occupies a multi-page chain. Clear means the
        /// key fits in a single page, with no link byte.
        const KEY_MULTIPLE = 1 << 2;

        /// The value occupies a multi-page chain. Clear means the
        /// value fits in a single page, with no link byte.
        const VALUE_MULTIPLE = 1 << 3;

        /// The low bit of the key format.
        const KEY_FORMAT_LO = 1 << 4;

        /// The high bit of the key format.
        const KEY_FORMAT_HI = 1 << 5;
    }
}

/// The index header, stored at the configured start address.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Index {
    /// The persistence marker; [`FORMAT_ID`] on a formatted store.
    pub format_id: u16,

    /// The page size in bytes.
    pub page_size: u32,

    /// The number of pages, including the reserved page 0.
    pub page_count: u8,

    /// The storage address of page 0.
    pub page_begin_address: u32,
}

impl Index {
    /// Serialises the index into its on-storage form.
    ///
    pub fn to_bytes(&self) -> [u8; INDEX_LEN] {
        let mut buf = [0u8; INDEX_LEN];
        buf[0..2].copy_from_slice(&self.format_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.page_size.to_le_bytes());
        buf[8] = self.page_count;
        buf[12..16].copy_from_slice(&self.page_begin_address.to_le_bytes());

        buf
    }

    /// Parses an index from its on-storage form.
    ///
    pub fn from_bytes(buf: &[u8; INDEX_LEN]) -> Self {
        Index {
            format_id: u16::from_le_bytes([buf[0], buf[1]]),
            page_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            page_count: buf[8],
            page_begin_address: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// A record in the entry table, binding a key chain and a value
/// chain. Entry 0 is reserved, mirroring the page 0 reservation.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The entry's state and chain shapes.
    pub metadata: Metadata,

    /// The first page of the key chain.
    pub key_page: u8,

    /// The first page of the value chain.
    pub value_page: u8,

    /// The number of trailing unused payload bytes in the last
    /// page of the value chain.
    pub remains: u8,
}

impl Entry {
    /// Returns an empty entry (metadata zero, no chains).
    ///
    pub fn empty() -> Self {
        Entry {
            metadata: Metadata::empty(),
            key_page: 0,
            value_page: 0,
            remains: 0,
        }
    }

    /// Returns whether the entry holds a live record.
    ///
    pub fn is_active(&self) -> bool {
        self.metadata.contains(Metadata::ACTIVE)
    }

    /// Returns whether the entry occupies its slot, either live
    /// or mid-edit.
    ///
    pub fn is_occupied(&self) -> bool {
        self.metadata
            .intersects(Metadata::ACTIVE | Metadata::OPEN)
    }

    /// Serialises the entry into its on-storage form.
    ///
    pub fn to_bytes(&self) -> [u8; ENTRY_LEN] {
        [
            self.metadata.bits(),
            self.key_page,
            self.value_page,
            self.remains,
        ]
    }

    /// Parses an entry from its on-storage form. Reserved
    /// metadata bits are dropped.
    ///
    pub fn from_bytes(buf: &[u8; ENTRY_LEN]) -> Self {
        Entry {
            metadata: Metadata::from_bits_truncate(buf[0]),
            key_page: buf[1],
            value_page: buf[2],
            remains: buf[3],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_layout() {
        let index = Index {
            format_id: FORMAT_ID,
            page_size: 12,
            page_count: 128,
            page_begin_address: 0x0210,
        };

        let bytes = index.to_bytes();
        assert_eq!(
            bytes,
            [
                0xFE, 0x5A, 0, 0, // format_id, little-endian, then padding
                12, 0, 0, 0, // page_size
                128, 0, 0, 0, // page_count, then padding
                0x10, 0x02, 0, 0, // page_begin_address
            ]
        );

        assert_eq!(Index::from_bytes(&bytes), index);
    }

    #[test]
    fn entry_layout() {
        let entry = Entry {
            metadata: Metadata::ACTIVE | Metadata::VALUE_MULTIPLE,
            key_page: 3,
            value_page: 17,
            remains: 9,
        };

        let bytes = entry.to_bytes();
        assert_eq!(bytes, [0b0000_1001, 3, 17, 9]);
        assert_eq!(Entry::from_bytes(&bytes), entry);
    }

    #[test]
    fn entry_reserved_bits_are_dropped() {
        let entry = Entry::from_bytes(&[0b1100_0001, 1, 2, 0]);
        assert_eq!(entry.metadata, Metadata::ACTIVE);
        assert!(entry.is_active());
        assert!(entry.is_occupied());
    }

    #[test]
    fn entry_states() {
        assert!(!Entry::empty().is_occupied());

        let open = Entry {
            metadata: Metadata::OPEN,
            key_page: 4,
            value_page: 0,
            remains: 0,
        };
        assert!(open.is_occupied());
        assert!(!open.is_active());
    }
}
