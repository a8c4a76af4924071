// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements an in-memory storage device.
//!
//! [`InMemory`] backs the storage port with a plain byte vector. It
//! exists so the engine can be exercised on a host: the backing
//! buffer can be shared between two device handles (simulating a
//! reboot that preserves the medium), and program faults can be
//! injected at a chosen point to probe the engine's failure paths.

use crate::{check_transfer, Error, Operations, Storage, WORD_SIZE};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// An in-memory storage device.
///
/// All handles produced by [`share`](InMemory::share) observe the
/// same backing bytes, so dropping an engine and building a new one
/// over a shared handle behaves like a power cycle.
///
pub struct InMemory {
    // The backing bytes, shared between handles.
    data: Arc<Mutex<Vec<u8>>>,

    // The number of successful program calls remaining
    // before every further program fails, or None if no
    // fault is armed. Shared, so a fault armed on one
    // handle applies to the medium, not the handle.
    fault_after: Arc<Mutex<Option<usize>>>,
}

impl InMemory {
    /// Returns a zero-filled device of the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a multiple of the word size.
    ///
    pub fn new(capacity: usize) -> Self {
        if capacity % WORD_SIZE != 0 {
            panic!(
                "in-memory device capacity {} is not a multiple of {}",
                capacity, WORD_SIZE
            );
        }

        InMemory {
            data: Arc::new(Mutex::new(vec![0u8; capacity])),
            fault_after: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a second handle over the same backing bytes.
    ///
    pub fn share(&self) -> Self {
        InMemory {
            data: Arc::clone(&self.data),
            fault_after: Arc::clone(&self.fault_after),
        }
    }

    /// Arms a program fault: the next `successes` program calls
    /// complete normally, then every further call fails with
    /// [`Error::DeviceError`] until [`clear_fault`](Self::clear_fault)
    /// is called.
    ///
    pub fn fail_programs_after(&self, successes: usize) {
        *self.fault_after.lock() = Some(successes);
    }

    /// Disarms any armed program fault.
    ///
    pub fn clear_fault(&self) {
        *self.fault_after.lock() = None;
    }
}

impl Storage for InMemory {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.lock().len()
    }

    fn operations(&self) -> Operations {
        Operations::READ | Operations::PROGRAM
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), Error> {
        let data = self.data.lock();
        check_transfer(addr, buf.len(), data.len())?;
        buf.copy_from_slice(&data[addr..(addr + buf.len())]);

        Ok(())
    }

    fn program(&mut self, addr: usize, buf: &[u8]) -> Result<(), Error> {
        let mut data = self.data.lock();
        check_transfer(addr, buf.len(), data.len())?;

        let mut fault = self.fault_after.lock();
        if let Some(successes) = *fault {
            if successes == 0 {
                return Err(Error::DeviceError);
            }

            *fault = Some(successes - 1);
        }

        data[addr..(addr + buf.len())].copy_from_slice(buf);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_program_round_trip() {
        let mut dev = InMemory::new(64);
        assert_eq!(dev.init(), Ok(()));
        assert_eq!(dev.capacity(), 64);
        assert!(dev.operations().contains(Operations::READ | Operations::PROGRAM));

        dev.program(8, &[1, 2, 3, 4]).expect("program");

        let mut buf = [0u8; 8];
        dev.read(4, &mut buf).expect("read");
        assert_eq!(buf, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn rejects_bad_transfers() {
        let mut dev = InMemory::new(64);
        let mut buf = [0u8; 4];
        assert_eq!(dev.read(2, &mut buf), Err(Error::Misaligned));
        assert_eq!(dev.read(64, &mut buf), Err(Error::OutOfRange));
        assert_eq!(dev.program(0, &[0u8; 6]), Err(Error::Misaligned));
        assert_eq!(dev.program(62, &[0u8; 4]), Err(Error::Misaligned));
        assert_eq!(dev.program(60, &[0u8; 8]), Err(Error::OutOfRange));
    }

    #[test]
    fn shared_handles_see_the_same_bytes() {
        let mut dev = InMemory::new(32);
        let mut other = dev.share();

        dev.program(0, &[0xAA; 4]).expect("program");

        let mut buf = [0u8; 4];
        other.read(0, &mut buf).expect("read");
        assert_eq!(buf, [0xAA; 4]);
    }

    #[test]
    fn injected_fault_fires_after_n_programs() {
        let mut dev = InMemory::new(32);
        dev.fail_programs_after(2);

        assert_eq!(dev.program(0, &[1; 4]), Ok(()));
        assert_eq!(dev.program(4, &[2; 4]), Ok(()));
        assert_eq!(dev.program(8, &[3; 4]), Err(Error::DeviceError));
        assert_eq!(dev.program(8, &[3; 4]), Err(Error::DeviceError));

        // The failed programs left the region untouched.
        let mut buf = [9u8; 4];
        dev.read(8, &mut buf).expect("read");
        assert_eq!(buf, [0; 4]);

        dev.clear_fault();
        assert_eq!(dev.program(8, &[3; 4]), Ok(()));
    }
}
