// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the storage port: a linear byte-addressed non-volatile
//! medium that can be read and programmed in 4-byte-aligned regions.
//!
//! The port deliberately exposes very little. A device is a flat
//! sequence of bytes with an `init` step, a capacity, and two
//! transfers, [`read`](Storage::read) and [`program`](Storage::program),
//! both of which require the address and the length to be multiples of
//! four. Anything richer (page chains, the entry table, the index
//! record) is layered on top by the engine crate.
//!
//! The [`memory`] module provides an in-memory device with injectable
//! program faults, used by the test suites of every crate in the
//! workspace.

#![no_std]

extern crate alloc;

use bitflags::bitflags;

pub mod memory;

/// The alignment, in bytes, required of every transfer address
/// and length.
///
pub const WORD_SIZE: usize = 4;

bitflags! {
    /// The list of transfers that can be supported by a device.
    ///
    pub struct Operations: usize {
        /// Read data from the device.
        const READ = 1 << 0;

        /// Program data into the device.
        const PROGRAM = 1 << 1;
    }
}

/// Describes an error encountered while operating on the device.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The transfer address or length was not a multiple
    /// of [`WORD_SIZE`].
    Misaligned,

    /// The transfer would exceed the device capacity.
    OutOfRange,

    /// The device encountered an error while performing
    /// the requested operation.
    DeviceError,

    /// The requested operation is not supported.
    NotSupported,
}

/// Represents a byte-addressed non-volatile storage device.
///
pub trait Storage {
    /// Prepares the device for use. Called once, before any
    /// transfer.
    ///
    fn init(&mut self) -> Result<(), Error>;

    /// Returns the device capacity in bytes.
    ///
    fn capacity(&self) -> usize;

    /// Returns the set of transfers supported by the device.
    ///
    /// If an unsupported transfer is attempted, it will return
    /// [`Error::NotSupported`].
    ///
    fn operations(&self) -> Operations;

    /// Populates a byte slice with data from the device, starting
    /// at the byte offset `addr`.
    ///
    /// Both `addr` and `buf.len()` must be multiples of
    /// [`WORD_SIZE`].
    ///
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes data from a byte slice into the device, starting at
    /// the byte offset `addr`.
    ///
    /// Both `addr` and `buf.len()` must be multiples of
    /// [`WORD_SIZE`]. A failed program may leave the addressed
    /// region in an unspecified state; callers must not assume
    /// partial-program atomicity.
    ///
    fn program(&mut self, addr: usize, buf: &[u8]) -> Result<(), Error>;
}

/// Returns an error unless both the address and the length
/// describe a word-aligned region within `capacity` bytes.
///
pub fn check_transfer(addr: usize, len: usize, capacity: usize) -> Result<(), Error> {
    if addr % WORD_SIZE != 0 || len % WORD_SIZE != 0 {
        return Err(Error::Misaligned);
    }

    match addr.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfRange),
    }
}
