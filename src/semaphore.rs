// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// System V counting semaphore (a set of exactly one).
// Timed waits use semtimedop when the kernel has it, otherwise a
// non-blocking retry loop that measures real elapsed time.

use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::error::{translate, Call, ObjectKind, Result, UsageError};
use crate::handle::{
    self, apply_perm, check_writable, lookup, perm_value, FieldSpec, FieldType, FieldValue,
    IpcObject, PermField, Permissions,
};
use crate::key::{self, Key, KeyRequest, OpenFlags};
use crate::platform::{sysv, CAPABILITIES};

const KIND: ObjectKind = ObjectKind::Semaphore;

/// Property table for [`Semaphore::get_field`] / [`Semaphore::set_field`].
pub const SEMAPHORE_FIELDS: &[FieldSpec] = &[
    FieldSpec::ro("key", FieldType::Int),
    FieldSpec::ro("id", FieldType::Int),
    FieldSpec::rw("value", FieldType::Int),
    FieldSpec::rw("block", FieldType::Bool),
    FieldSpec::rw("undo", FieldType::Bool),
    FieldSpec::rw("mode", FieldType::Int),
    FieldSpec::rw("uid", FieldType::Int),
    FieldSpec::rw("gid", FieldType::Int),
    FieldSpec::ro("cuid", FieldType::Int),
    FieldSpec::ro("cgid", FieldType::Int),
    FieldSpec::ro("last_pid", FieldType::Int),
    FieldSpec::ro("waiting_for_nonzero", FieldType::Int),
    FieldSpec::ro("waiting_for_zero", FieldType::Int),
    FieldSpec::ro("o_time", FieldType::Time),
];

/// Creation-time parameters. Ignored by the kernel when opening an existing semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreOptions {
    pub mode: u32,
    pub initial_value: i32,
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            mode: 0o600,
            initial_value: 0,
        }
    }
}

/// A handle to a kernel semaphore.
///
/// Blocking calls hold no lock of this crate while parked in the kernel, so a
/// handle can be shared across threads (`Arc<Semaphore>`); wake order among
/// waiters is decided by the kernel.
pub struct Semaphore {
    object: IpcObject,
    block: bool,
    undo: bool,
}

impl Semaphore {
    /// Open or create a semaphore.
    ///
    /// The initial value is written only when this call created the semaphore
    /// (`CREATE_EXCLUSIVE`) and the mode grants the owner write access.
    pub fn open<K: Into<KeyRequest>>(
        key: K,
        flags: OpenFlags,
        options: SemaphoreOptions,
    ) -> Result<Self> {
        let max = CAPABILITIES.semaphore_value_max;
        if options.initial_value < 0 || options.initial_value > max {
            return Err(UsageError::ValueOutOfRange { max }.into());
        }

        let (key, id) = key::resolve(key.into(), flags, options.mode, KIND, sysv::semget)?;
        let sem = Self {
            object: IpcObject::new(KIND, key, id),
            block: true,
            undo: false,
        };
        log::debug!("semaphore opened: {}", sem.object);

        if flags.creates_new() && options.mode & 0o200 != 0 {
            log::trace!("semaphore {}: initial value {}", id, options.initial_value);
            initialise(id, options.initial_value, sysv::semctl_setval)?;
        }
        Ok(sem)
    }

    /// Open an existing semaphore; fails if `key` is unknown.
    pub fn open_existing<K: Into<KeyRequest>>(key: K) -> Result<Self> {
        Self::open(key, OpenFlags::empty(), SemaphoreOptions::default())
    }

    /// Create a brand new semaphore with a generated key.
    pub fn create(initial_value: i32) -> Result<Self> {
        Self::open(
            KeyRequest::Generate,
            OpenFlags::CREATE_EXCLUSIVE,
            SemaphoreOptions {
                initial_value,
                ..SemaphoreOptions::default()
            },
        )
    }

    pub fn key(&self) -> Key {
        self.object.key()
    }

    pub fn id(&self) -> i32 {
        self.object.id()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Take one unit, waiting as long as the block mode allows.
    pub fn acquire(&self) -> Result<()> {
        self.acquire_with(None, 1)
    }

    /// Take one unit, giving up with `Busy` after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        self.acquire_with(Some(timeout), 1)
    }

    /// Take one unit only if that is possible right now.
    pub fn try_acquire(&self) -> Result<()> {
        self.acquire_with(Some(Duration::ZERO), 1)
    }

    /// Subtract `|delta|` from the value, waiting until that keeps it non-negative.
    ///
    /// `timeout` of `None` waits indefinitely; `Some(Duration::ZERO)` tries once.
    /// A non-blocking handle (see [`set_block`](Self::set_block)) never waits.
    pub fn acquire_with(&self, timeout: Option<Duration>, delta: i32) -> Result<()> {
        let delta = sem_delta(delta)?;
        self.perform(-delta, timeout)
    }

    /// Add one unit.
    pub fn release(&self) -> Result<()> {
        self.release_n(1)
    }

    /// Add `|delta|` units; fails if the value would exceed `SEMAPHORE_VALUE_MAX`.
    pub fn release_n(&self, delta: i32) -> Result<()> {
        let delta = sem_delta(delta)?;
        self.perform(delta, None)
    }

    /// Wait until the value is exactly zero.
    pub fn wait_for_zero(&self) -> Result<()> {
        self.perform(0, None)
    }

    pub fn wait_for_zero_timeout(&self, timeout: Duration) -> Result<()> {
        self.perform(0, Some(timeout))
    }

    /// Acquire one unit and release it again when the guard drops.
    pub fn lock(&self) -> Result<SemaphoreGuard<'_>> {
        self.acquire()?;
        Ok(SemaphoreGuard { sem: self })
    }

    fn op_flags(&self) -> i16 {
        let mut flags = 0;
        if !self.block {
            flags |= libc::IPC_NOWAIT;
        }
        if self.undo {
            flags |= libc::SEM_UNDO;
        }
        flags as i16
    }

    fn perform(&self, delta: i16, timeout: Option<Duration>) -> Result<()> {
        self.object.ensure_live()?;
        let id = self.id();
        let flags = self.op_flags();
        log::trace!("semop: id={id} delta={delta} flags={flags:#x} timeout={timeout:?}");

        let result = match timeout {
            None => sysv::semop(id, delta, flags),
            Some(t) if CAPABILITIES.semtimedop => sysv::semtimedop(id, delta, flags, t),
            Some(_) if !self.block => sysv::semop(id, delta, flags),
            Some(t) => {
                let nowait = flags | libc::IPC_NOWAIT as i16;
                poll_until(t, CAPABILITIES.poll_quantum, || sysv::semop(id, delta, nowait))
            }
        };
        result.map_err(|e| translate(e, KIND, Call::Operate))
    }

    // ------------------------------------------------------------------
    // Handle-local settings
    // ------------------------------------------------------------------

    /// Default wait mode: when false every operation behaves as `IPC_NOWAIT`.
    pub fn block(&self) -> bool {
        self.block
    }

    pub fn set_block(&mut self, block: bool) {
        self.block = block;
    }

    /// Whether operations are undone by the kernel when this process exits (`SEM_UNDO`).
    pub fn undo(&self) -> bool {
        self.undo
    }

    pub fn set_undo(&mut self, undo: bool) {
        self.undo = undo;
    }

    // ------------------------------------------------------------------
    // Kernel-side state; every read re-queries the kernel.
    // ------------------------------------------------------------------

    fn ctl_get(&self, cmd: libc::c_int) -> Result<i32> {
        self.object.ensure_live()?;
        sysv::semctl_get(self.id(), cmd).map_err(|e| translate(e, KIND, Call::Operate))
    }

    fn stat(&self) -> Result<sysv::SemidDs> {
        self.object.ensure_live()?;
        sysv::semctl_stat(self.id()).map_err(|e| translate(e, KIND, Call::Operate))
    }

    pub fn value(&self) -> Result<i32> {
        self.ctl_get(libc::GETVAL)
    }

    pub fn set_value(&self, value: i32) -> Result<()> {
        let max = CAPABILITIES.semaphore_value_max;
        if !(0..=max).contains(&value) {
            return Err(UsageError::ValueOutOfRange { max }.into());
        }
        self.object.ensure_live()?;
        sysv::semctl_setval(self.id(), value).map_err(|e| translate(e, KIND, Call::Operate))
    }

    /// Pid of the last process to operate on the semaphore.
    pub fn last_pid(&self) -> Result<i32> {
        self.ctl_get(libc::GETPID)
    }

    /// Number of processes waiting for the value to increase.
    pub fn waiting_for_nonzero(&self) -> Result<i32> {
        self.ctl_get(libc::GETNCNT)
    }

    /// Number of processes waiting for the value to reach zero.
    pub fn waiting_for_zero(&self) -> Result<i32> {
        self.ctl_get(libc::GETZCNT)
    }

    /// Time of the last `semop`, `None` if nothing has operated on it yet.
    pub fn last_operation_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.sem_otime))
    }

    pub fn permissions(&self) -> Result<Permissions> {
        Ok(Permissions::from_raw(&self.stat()?.sem_perm))
    }

    pub fn mode(&self) -> Result<u32> {
        Ok(self.permissions()?.mode)
    }

    pub fn set_mode(&self, mode: u32) -> Result<()> {
        self.set_perm(PermField::Mode, mode)
    }

    pub fn uid(&self) -> Result<u32> {
        Ok(self.permissions()?.uid)
    }

    pub fn set_uid(&self, uid: u32) -> Result<()> {
        self.set_perm(PermField::Uid, uid)
    }

    pub fn gid(&self) -> Result<u32> {
        Ok(self.permissions()?.gid)
    }

    pub fn set_gid(&self, gid: u32) -> Result<()> {
        self.set_perm(PermField::Gid, gid)
    }

    pub fn cuid(&self) -> Result<u32> {
        Ok(self.permissions()?.cuid)
    }

    pub fn cgid(&self) -> Result<u32> {
        Ok(self.permissions()?.cgid)
    }

    fn set_perm(&self, field: PermField, value: u32) -> Result<()> {
        // IPC_SET copies uid, gid and mode together, so start from current values.
        let mut ds = self.stat()?;
        apply_perm(&mut ds.sem_perm, field, value);
        sysv::semctl_set(self.id(), &mut ds).map_err(|e| translate(e, KIND, Call::Operate))
    }

    /// Read any entry of [`SEMAPHORE_FIELDS`].
    pub fn get_field(&self, name: &str) -> Result<FieldValue> {
        let entry = lookup(SEMAPHORE_FIELDS, name)?;
        Ok(match entry.name {
            "key" => FieldValue::Int(self.key().raw() as i64),
            "id" => FieldValue::Int(self.id() as i64),
            "value" => FieldValue::Int(self.value()? as i64),
            "block" => FieldValue::Bool(self.block),
            "undo" => FieldValue::Bool(self.undo),
            "mode" => FieldValue::Int(self.mode()? as i64),
            "uid" => FieldValue::Int(self.uid()? as i64),
            "gid" => FieldValue::Int(self.gid()? as i64),
            "cuid" => FieldValue::Int(self.cuid()? as i64),
            "cgid" => FieldValue::Int(self.cgid()? as i64),
            "last_pid" => FieldValue::Int(self.last_pid()? as i64),
            "waiting_for_nonzero" => FieldValue::Int(self.waiting_for_nonzero()? as i64),
            "waiting_for_zero" => FieldValue::Int(self.waiting_for_zero()? as i64),
            "last_operation_time" => FieldValue::Time(self.last_operation_time()?),
            other => return Err(UsageError::UnknownField(other.to_owned()).into()),
        })
    }

    /// Write a writable entry of [`SEMAPHORE_FIELDS`]; read-only names fail
    /// with a usage error before any syscall.
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let entry = check_writable(SEMAPHORE_FIELDS, name)?;
        match entry.name {
            "block" => self.set_block(value.as_bool(entry)?),
            "undo" => self.set_undo(value.as_bool(entry)?),
            "value" => {
                let v = value.as_int(entry)?;
                let v = i32::try_from(v).map_err(|_| UsageError::ValueOutOfRange {
                    max: CAPABILITIES.semaphore_value_max,
                })?;
                self.set_value(v)?;
            }
            other => {
                let field = PermField::from_name(other).ok_or(UsageError::ReadOnlyField(entry.name))?;
                self.set_perm(field, perm_value(entry, value)?)?;
            }
        }
        Ok(())
    }

    /// Remove the semaphore from the system. Processes blocked on it wake with
    /// an existential error.
    pub fn remove(&self) -> Result<()> {
        self.object.ensure_live()?;
        remove_semaphore(self.id())?;
        self.object.mark_removed();
        Ok(())
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.object.fmt(f)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("key", &self.key())
            .field("id", &self.id())
            .field("block", &self.block)
            .field("undo", &self.undo)
            .finish()
    }
}

/// Remove the semaphore with kernel id `id`.
pub fn remove_semaphore(id: i32) -> Result<()> {
    log::debug!("removing semaphore id={id}");
    sysv::semctl_remove(id).map_err(|e| translate(e, KIND, Call::Operate))
}

/// Holds one unit of a semaphore; releases it on drop.
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl<'a> SemaphoreGuard<'a> {
    pub fn semaphore(&self) -> &'a Semaphore {
        self.sem
    }
}

impl<'a> Drop for SemaphoreGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release() {
            log::warn!("semaphore {}: release on guard drop failed: {e}", self.sem.id());
        }
    }
}

/// Magnitude of a user delta as a `sem_op` value.
fn sem_delta(delta: i32) -> std::result::Result<i16, UsageError> {
    if delta == 0 {
        return Err(UsageError::ZeroDelta);
    }
    delta
        .checked_abs()
        .and_then(|d| i16::try_from(d).ok())
        .ok_or(UsageError::DeltaOutOfRange(delta))
}

/// Retry a non-blocking `attempt` until it stops reporting EAGAIN or `budget` runs out.
///
/// Each round sleeps at most `quantum` and charges the budget with the time
/// that actually passed, attempt included.
pub(crate) fn poll_until<F>(budget: Duration, quantum: Duration, mut attempt: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    let mut remaining = budget;
    loop {
        let started = Instant::now();
        match attempt() {
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
            other => return other,
        }
        if remaining.is_zero() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        thread::sleep(quantum.min(remaining));
        remaining = remaining.saturating_sub(started.elapsed());
    }
}

/// Write the initial value of a semaphore this process just created. On
/// failure the semaphore is removed, since no other handle can reach it yet.
fn initialise<F>(id: i32, value: i32, set: F) -> Result<()>
where
    F: FnOnce(i32, i32) -> io::Result<()>,
{
    set(id, value).map_err(|e| {
        if let Err(rm) = sysv::semctl_remove(id) {
            log::warn!("semaphore {id}: removal after failed initialisation failed: {rm}");
        }
        translate(e, KIND, Call::Operate)
    })
}
