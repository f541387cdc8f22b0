// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Raw System V IPC syscalls: semaphores, shared memory and message queues.
// Every `unsafe` block of the crate that touches the kernel lives here.
// Calls return `io::Result` and never surface EINTR.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use libc::{c_int, c_long, c_void, key_t};

/// Retry `f` while it fails with EINTR.
fn retry_eintr<T, F>(mut f: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match f() {
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            other => return other,
        }
    }
}

fn check(rc: c_int) -> io::Result<c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

// ---------------------------------------------------------------------------
// semid_ds: the libc crate does not describe it for Linux, so spell out the
// glibc/musl 64-bit layout.  Only `sem_perm` and `sem_otime` are consumed.
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android"))]
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub(crate) struct SemidDs {
    pub(crate) sem_perm: libc::ipc_perm,
    pub(crate) sem_otime: libc::time_t,
    __reserved1: libc::c_ulong,
    pub(crate) sem_ctime: libc::time_t,
    __reserved2: libc::c_ulong,
    pub(crate) sem_nsems: libc::c_ulong,
    __reserved3: libc::c_ulong,
    __reserved4: libc::c_ulong,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) type SemidDs = libc::semid_ds;

// ---------------------------------------------------------------------------
// ipc_perm: the key field is spelled differently on each kernel.
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn perm_key(perm: &libc::ipc_perm) -> key_t {
    perm.__key
}

#[cfg(target_vendor = "apple")]
pub(crate) fn perm_key(perm: &libc::ipc_perm) -> key_t {
    perm._key
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
pub(crate) fn perm_key(perm: &libc::ipc_perm) -> key_t {
    perm.key
}

/// Linux-only shared memory flags; zero where the kernel lacks them.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod shm_flags {
    pub(crate) const HUGETLB: libc::c_int = libc::SHM_HUGETLB;
    pub(crate) const NORESERVE: libc::c_int = libc::SHM_NORESERVE;
    pub(crate) const REMAP: libc::c_int = libc::SHM_REMAP;
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) mod shm_flags {
    pub(crate) const HUGETLB: libc::c_int = 0;
    pub(crate) const NORESERVE: libc::c_int = 0;
    pub(crate) const REMAP: libc::c_int = 0;
}

// ---------------------------------------------------------------------------
// Semaphores (always a set of exactly one)
// ---------------------------------------------------------------------------

pub(crate) fn semget(key: key_t, flags: c_int) -> io::Result<c_int> {
    check(unsafe { libc::semget(key, 1, flags) })
}

/// Apply one `sem_op` to semaphore 0 of the set. Blocks unless `IPC_NOWAIT` is in `flags`.
pub(crate) fn semop(id: c_int, delta: i16, flags: i16) -> io::Result<()> {
    retry_eintr(|| {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        };
        check(unsafe { libc::semop(id, &mut op, 1) }).map(|_| ())
    })
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos"
))]
extern "C" {
    #[link_name = "semtimedop"]
    fn sys_semtimedop(
        semid: c_int,
        sops: *mut libc::sembuf,
        nsops: libc::size_t,
        timeout: *const libc::timespec,
    ) -> c_int;
}

#[cfg_attr(
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "solaris",
        target_os = "illumos"
    )),
    allow(dead_code)
)]
fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// `semop` bounded by a relative `timeout`. An interrupted wait is re-issued
/// with only the time that is still left.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos"
))]
pub(crate) fn semtimedop(id: c_int, delta: i16, flags: i16, timeout: Duration) -> io::Result<()> {
    use std::time::Instant;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ts = to_timespec(remaining);
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        };
        let rc = unsafe { sys_semtimedop(id, &mut op, 1, &ts) };
        if rc != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos"
)))]
pub(crate) fn semtimedop(_id: c_int, _delta: i16, _flags: i16, _timeout: Duration) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// `semctl` commands that take no argument and return an int (GETVAL, GETPID, GETNCNT, ...).
pub(crate) fn semctl_get(id: c_int, cmd: c_int) -> io::Result<c_int> {
    check(unsafe { libc::semctl(id, 0, cmd) })
}

pub(crate) fn semctl_setval(id: c_int, value: c_int) -> io::Result<()> {
    check(unsafe { libc::semctl(id, 0, libc::SETVAL, value) }).map(|_| ())
}

pub(crate) fn semctl_stat(id: c_int) -> io::Result<SemidDs> {
    let mut ds: SemidDs = unsafe { mem::zeroed() };
    check(unsafe { libc::semctl(id, 0, libc::IPC_STAT, &mut ds as *mut SemidDs) })?;
    Ok(ds)
}

pub(crate) fn semctl_set(id: c_int, ds: &mut SemidDs) -> io::Result<()> {
    check(unsafe { libc::semctl(id, 0, libc::IPC_SET, ds as *mut SemidDs) }).map(|_| ())
}

pub(crate) fn semctl_remove(id: c_int) -> io::Result<()> {
    check(unsafe { libc::semctl(id, 0, libc::IPC_RMID) }).map(|_| ())
}

// ---------------------------------------------------------------------------
// Shared memory
// ---------------------------------------------------------------------------

pub(crate) fn shmget(key: key_t, size: usize, flags: c_int) -> io::Result<c_int> {
    check(unsafe { libc::shmget(key, size, flags) })
}

/// Map segment `id` into this process. `hint` may be null to let the kernel choose.
pub(crate) fn shmat(id: c_int, hint: *const c_void, flags: c_int) -> io::Result<*mut u8> {
    let addr = unsafe { libc::shmat(id, hint, flags) };
    if addr as isize == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as *mut u8)
}

pub(crate) fn shmdt(addr: *mut u8) -> io::Result<()> {
    check(unsafe { libc::shmdt(addr as *const c_void) }).map(|_| ())
}

pub(crate) fn shmctl_stat(id: c_int) -> io::Result<libc::shmid_ds> {
    let mut ds: libc::shmid_ds = unsafe { mem::zeroed() };
    check(unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) })?;
    Ok(ds)
}

pub(crate) fn shmctl_set(id: c_int, ds: &mut libc::shmid_ds) -> io::Result<()> {
    check(unsafe { libc::shmctl(id, libc::IPC_SET, ds) }).map(|_| ())
}

pub(crate) fn shmctl_remove(id: c_int) -> io::Result<()> {
    check(unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) }).map(|_| ())
}

/// Copy `src` into a mapping at `base + offset`.
///
/// # Safety
/// `base` must point to a live mapping of at least `offset + src.len()` writable bytes.
pub(crate) unsafe fn copy_to_mapping(base: *mut u8, offset: usize, src: &[u8]) {
    ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), src.len());
}

/// Copy `len` bytes from a mapping at `base + offset`.
///
/// # Safety
/// `base` must point to a live mapping of at least `offset + len` readable bytes.
pub(crate) unsafe fn copy_from_mapping(base: *const u8, offset: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(base.add(offset), len).to_vec()
}

/// Set `len` bytes of a mapping to `byte`.
///
/// # Safety
/// `base` must point to a live mapping of at least `len` writable bytes.
pub(crate) unsafe fn fill_mapping(base: *mut u8, len: usize, byte: u8) {
    ptr::write_bytes(base, byte, len);
}

// ---------------------------------------------------------------------------
// Message queues
// ---------------------------------------------------------------------------

/// Size of the `long mtype` header that precedes every payload.
pub(crate) const MTYPE_LEN: usize = mem::size_of::<c_long>();

pub(crate) fn msgget(key: key_t, flags: c_int) -> io::Result<c_int> {
    check(unsafe { libc::msgget(key, flags) })
}

/// Send `payload` tagged with `mtype`. Blocks while the queue is full unless
/// `IPC_NOWAIT` is in `flags`.
pub(crate) fn msgsnd(id: c_int, mtype: c_long, payload: &[u8], flags: c_int) -> io::Result<()> {
    let mut buf = Vec::with_capacity(MTYPE_LEN + payload.len());
    buf.extend_from_slice(&mtype.to_ne_bytes());
    buf.extend_from_slice(payload);
    retry_eintr(|| {
        check(unsafe { libc::msgsnd(id, buf.as_ptr() as *const c_void, payload.len(), flags) })
            .map(|_| ())
    })
}

/// Receive one message whose payload fits in `max_len` bytes.
/// Returns `(payload, mtype)`.
pub(crate) fn msgrcv(
    id: c_int,
    max_len: usize,
    selector: c_long,
    flags: c_int,
) -> io::Result<(Vec<u8>, c_long)> {
    let total = MTYPE_LEN
        .checked_add(max_len)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
    let mut buf: Vec<u8> = Vec::new();
    buf.try_reserve_exact(total)
        .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
    let received = retry_eintr(|| {
        let rc = unsafe {
            libc::msgrcv(
                id,
                buf.as_mut_ptr() as *mut c_void,
                max_len,
                selector,
                flags,
            )
        };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    })?;
    // The kernel wrote the type tag and `received` payload bytes.
    unsafe { buf.set_len(MTYPE_LEN + received) };

    let mut tag = [0u8; MTYPE_LEN];
    tag.copy_from_slice(&buf[..MTYPE_LEN]);
    let mtype = c_long::from_ne_bytes(tag);
    buf.drain(..MTYPE_LEN);
    Ok((buf, mtype))
}

pub(crate) fn msgctl_stat(id: c_int) -> io::Result<libc::msqid_ds> {
    let mut ds: libc::msqid_ds = unsafe { mem::zeroed() };
    check(unsafe { libc::msgctl(id, libc::IPC_STAT, &mut ds) })?;
    Ok(ds)
}

pub(crate) fn msgctl_set(id: c_int, ds: &mut libc::msqid_ds) -> io::Result<()> {
    check(unsafe { libc::msgctl(id, libc::IPC_SET, ds) }).map(|_| ())
}

pub(crate) fn msgctl_remove(id: c_int) -> io::Result<()> {
    check(unsafe { libc::msgctl(id, libc::IPC_RMID, ptr::null_mut()) }).map(|_| ())
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub(crate) fn ftok(path: &CStr, project_id: u8) -> io::Result<key_t> {
    let key = unsafe { libc::ftok(path.as_ptr(), project_id as c_int) };
    if key == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_eintr_retries_until_success() {
        let mut calls = 0;
        let r: io::Result<u32> = retry_eintr(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from_raw_os_error(libc::EINTR))
            } else {
                Ok(7)
            }
        });
        assert_eq!(r.unwrap(), 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_eintr_passes_other_errors() {
        let r: io::Result<()> = retry_eintr(|| Err(io::Error::from_raw_os_error(libc::EAGAIN)));
        assert_eq!(r.unwrap_err().raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn timespec_split() {
        let ts = to_timespec(Duration::from_millis(2500));
        assert_eq!(ts.tv_sec, 2);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }

    #[test]
    fn shmctl_stat_rejects_bogus_id() {
        assert!(shmctl_stat(-1).is_err());
    }
}
