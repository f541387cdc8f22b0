// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Platform capability record plus the raw System V syscall layer.
// Everything above this module branches on `CAPABILITIES`, never on cfg(target_os).

use std::sync::OnceLock;
use std::time::Duration;

pub(crate) mod sysv;

mod generated {
    include!(concat!(env!("OUT_DIR"), "/sysv_config.rs"));
}

/// Immutable description of what the host kernel offers.
///
/// Resolved at build time by `build.rs`; never changes for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the kernel has a native timed semaphore wait (`semtimedop`).
    pub semtimedop: bool,
    /// Largest value a semaphore may hold (SEMVMX).
    pub semaphore_value_max: i32,
    /// Smallest key accepted by the key resolver.
    pub key_min: i64,
    /// Largest key accepted by the key resolver.
    pub key_max: i64,
    /// Page size assumed when the runtime query is unavailable.
    pub page_size_default: usize,
    /// Sleep quantum used by the timeout emulation loop.
    pub poll_quantum: Duration,
    /// Whether shared memory accepts huge pages, no-reserve and remap.
    pub shm_linux_flags: bool,
}

pub const CAPABILITIES: Capabilities = Capabilities {
    semtimedop: generated::SEMTIMEDOP_EXISTS,
    semaphore_value_max: generated::SEMAPHORE_VALUE_MAX,
    key_min: libc::key_t::MIN as i64,
    key_max: libc::key_t::MAX as i64,
    page_size_default: generated::PAGE_SIZE_DEFAULT,
    poll_quantum: Duration::from_nanos(generated::SEMAPHORE_POLL_QUANTUM_NS),
    shm_linux_flags: generated::SHM_LINUX_FLAGS_EXIST,
};

/// Memory page size, queried from the kernel once per process.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v > 0 {
            v as usize
        } else {
            CAPABILITIES.page_size_default
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_is_signed() {
        assert!(CAPABILITIES.key_min < 0);
        assert!(CAPABILITIES.key_max > 0);
    }

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps.is_power_of_two());
        assert_eq!(ps, page_size());
    }

    #[test]
    fn semaphore_max_fits_in_sem_op() {
        assert!(CAPABILITIES.semaphore_value_max > 0);
        assert!(CAPABILITIES.semaphore_value_max <= i16::MAX as i32);
    }

    #[test]
    fn poll_quantum_nonzero() {
        assert!(CAPABILITIES.poll_quantum > Duration::ZERO);
    }
}
