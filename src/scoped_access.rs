// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// RAII guard that holds one unit of a semaphore for the lifetime of the
// access, providing read/write to a shared memory segment.

use crate::error::Result;
use crate::semaphore::{Semaphore, SemaphoreGuard};
use crate::shm::SharedMemory;

/// RAII guard: acquires the semaphore on construction, releases on drop.
/// Provides `read()` / `write()` access to the segment in between.
///
/// Two processes that agree on a semaphore (created with initial value 1)
/// and a segment take turns through this guard.
pub struct ScopedAccess<'a> {
    shm: &'a mut SharedMemory,
    _guard: SemaphoreGuard<'a>,
}

impl<'a> ScopedAccess<'a> {
    /// Acquire `sem` (waiting as its block mode allows) and borrow `shm`.
    pub fn new(sem: &'a Semaphore, shm: &'a mut SharedMemory) -> Result<Self> {
        let guard = sem.lock()?;
        log::trace!("scoped access: semaphore {} held for shm {}", sem.id(), shm.id());
        Ok(Self { shm, _guard: guard })
    }

    /// Read from `offset` to the end of the segment, or `byte_count` bytes.
    pub fn read(&self, byte_count: Option<usize>, offset: usize) -> Result<Vec<u8>> {
        self.shm.read(byte_count, offset)
    }

    /// Write `buf` at `offset`; fails without writing if it does not fit.
    pub fn write(&mut self, buf: &[u8], offset: usize) -> Result<()> {
        self.shm.write(buf, offset)
    }

    pub fn as_slice(&self) -> Result<&[u8]> {
        self.shm.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.shm.as_mut_slice()
    }

    /// Mapped size of the segment.
    pub fn size(&self) -> Result<usize> {
        Ok(self.shm.as_slice()?.len())
    }
}
