// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// System V shared memory segment handle.
// A handle attaches on open and keeps at most one mapping; Drop detaches it
// but never removes the segment.

use std::fmt;
use std::ptr::{self, NonNull};
use std::time::SystemTime;

use crate::error::{translate, Call, IpcError, ObjectKind, Result, UsageError};
use crate::handle::{
    self, apply_perm, check_writable, lookup, perm_value, FieldSpec, FieldType, FieldValue,
    IpcObject, PermField, Permissions,
};
use crate::key::{self, Key, KeyRequest, OpenFlags};
use crate::platform::{page_size, sysv, CAPABILITIES};

const KIND: ObjectKind = ObjectKind::SharedMemory;

/// Property table for [`SharedMemory::get_field`] / [`SharedMemory::set_field`].
pub const SHARED_MEMORY_FIELDS: &[FieldSpec] = &[
    FieldSpec::ro("key", FieldType::Int),
    FieldSpec::ro("id", FieldType::Int),
    FieldSpec::ro("size", FieldType::Int),
    FieldSpec::ro("attached", FieldType::Bool),
    FieldSpec::ro("read_only", FieldType::Bool),
    FieldSpec::ro("number_attached", FieldType::Int),
    FieldSpec::ro("creator_pid", FieldType::Int),
    FieldSpec::ro("last_pid", FieldType::Int),
    FieldSpec::ro("last_attach_time", FieldType::Time),
    FieldSpec::ro("last_detach_time", FieldType::Time),
    FieldSpec::ro("last_change_time", FieldType::Time),
    FieldSpec::rw("mode", FieldType::Int),
    FieldSpec::rw("uid", FieldType::Int),
    FieldSpec::rw("gid", FieldType::Int),
    FieldSpec::ro("cuid", FieldType::Int),
    FieldSpec::ro("cgid", FieldType::Int),
];

bitflags::bitflags! {
    /// Flags for mapping a segment into this process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachFlags: u32 {
        /// Map read-only (`SHM_RDONLY`).
        const READ_ONLY = 0b01;
        /// Round the address hint down to a valid boundary (`SHM_RND`).
        const ROUND = 0b10;
        /// Replace any mapping already at the address hint (`SHM_REMAP`, Linux only).
        const REMAP = 0b100;
    }
}

impl AttachFlags {
    fn to_raw(self) -> std::result::Result<libc::c_int, UsageError> {
        let mut raw = 0;
        if self.contains(AttachFlags::READ_ONLY) {
            raw |= libc::SHM_RDONLY;
        }
        if self.contains(AttachFlags::ROUND) {
            raw |= libc::SHM_RND;
        }
        if self.contains(AttachFlags::REMAP) {
            if !CAPABILITIES.shm_linux_flags {
                return Err(UsageError::Unsupported("SHM_REMAP"));
            }
            raw |= sysv::shm_flags::REMAP;
        }
        Ok(raw)
    }
}

/// Creation-time parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMemoryOptions {
    pub mode: u32,
    /// Requested size in bytes. 0 means one page when creating exclusively.
    pub size: usize,
    /// Byte written over the whole segment when this call creates it.
    pub fill: u8,
    /// Back the segment with huge pages (`SHM_HUGETLB`, Linux only).
    pub huge_pages: bool,
    /// Do not reserve swap for the segment (`SHM_NORESERVE`, Linux only).
    pub no_reserve: bool,
}

impl SharedMemoryOptions {
    fn creation_flags(&self) -> std::result::Result<libc::c_int, UsageError> {
        let mut raw = 0;
        if self.huge_pages {
            if !CAPABILITIES.shm_linux_flags {
                return Err(UsageError::Unsupported("SHM_HUGETLB"));
            }
            raw |= sysv::shm_flags::HUGETLB;
        }
        if self.no_reserve {
            if !CAPABILITIES.shm_linux_flags {
                return Err(UsageError::Unsupported("SHM_NORESERVE"));
            }
            raw |= sysv::shm_flags::NORESERVE;
        }
        Ok(raw)
    }
}

impl Default for SharedMemoryOptions {
    fn default() -> Self {
        Self {
            mode: 0o600,
            size: 0,
            fill: b' ',
            huge_pages: false,
            no_reserve: false,
        }
    }
}

/// A handle to a kernel shared memory segment.
///
/// Byte access goes through `read`/`write` (bounds-checked copies) or
/// `as_slice`/`as_mut_slice` (zero-copy views borrowed from the handle, so a
/// view cannot outlive the mapping). Other processes may write the segment
/// at any time; this handle does no locking of its own.
pub struct SharedMemory {
    object: IpcObject,
    base: *mut u8,
    mapped_len: usize,
    read_only: bool,
}

// The mapping belongs to the process, not to a thread. Mutation through this
// handle requires `&mut self`.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Open or create a segment and attach it.
    ///
    /// The mapping is read-only when `options.mode` lacks owner write. The
    /// fill byte is applied only when this call created the segment.
    pub fn open<K: Into<KeyRequest>>(
        key: K,
        flags: OpenFlags,
        options: SharedMemoryOptions,
    ) -> Result<Self> {
        let size = if options.size == 0 && flags.creates_new() {
            page_size()
        } else {
            options.size
        };

        let extra = options.creation_flags()?;
        let (key, id) = key::resolve(key.into(), flags, options.mode, KIND, |k, f| {
            sysv::shmget(k, size, f | extra)
        })?;
        log::debug!("shared memory opened: Key={key}, id={id}, requested size={size}");

        let mut shm = Self::detached(key, id);
        let attach_flags = if options.mode & 0o200 == 0 {
            AttachFlags::READ_ONLY
        } else {
            AttachFlags::empty()
        };
        shm.attach(None, attach_flags)?;

        if flags.creates_new() && !shm.read_only {
            log::trace!("shm {id}: filling {} bytes with {:#04x}", shm.mapped_len, options.fill);
            unsafe { sysv::fill_mapping(shm.base, shm.mapped_len, options.fill) };
        }
        Ok(shm)
    }

    /// Open an existing segment by key.
    pub fn open_existing<K: Into<KeyRequest>>(key: K) -> Result<Self> {
        Self::open(key, OpenFlags::empty(), SharedMemoryOptions::default())
    }

    /// Create a new segment of `size` bytes under a generated key.
    pub fn create(size: usize) -> Result<Self> {
        Self::open(
            KeyRequest::Generate,
            OpenFlags::CREATE_EXCLUSIVE,
            SharedMemoryOptions {
                size,
                ..SharedMemoryOptions::default()
            },
        )
    }

    fn detached(key: Key, id: i32) -> Self {
        Self {
            object: IpcObject::new(KIND, key, id),
            base: ptr::null_mut(),
            mapped_len: 0,
            read_only: false,
        }
    }

    pub fn key(&self) -> Key {
        self.object.key()
    }

    pub fn id(&self) -> i32 {
        self.object.id()
    }

    // ------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------

    /// Map the segment. An existing mapping of this handle is detached first.
    ///
    /// `address` of `None` lets the kernel choose where to map.
    pub fn attach(&mut self, address: Option<NonNull<u8>>, flags: AttachFlags) -> Result<()> {
        let raw_flags = flags.to_raw()?;
        self.object.ensure_live()?;
        if self.is_attached() {
            self.detach()?;
        }

        let id = self.id();
        let hint = address.map_or(ptr::null(), |p| p.as_ptr() as *const libc::c_void);
        log::trace!("shmat: id={id} hint={hint:p} flags={raw_flags:#x}");
        let base = sysv::shmat(id, hint, raw_flags)
            .map_err(|e| translate(e, KIND, Call::Attach))?;

        // The segment size is fixed at creation, so the mapping length is too.
        let len = match sysv::shmctl_stat(id) {
            Ok(ds) => ds.shm_segsz as usize,
            Err(e) => {
                let _ = sysv::shmdt(base);
                return Err(translate(e, KIND, Call::Operate));
            }
        };

        self.base = base;
        self.mapped_len = len;
        self.read_only = flags.contains(AttachFlags::READ_ONLY);
        log::debug!("shm {id} attached at {base:p} ({len} bytes, read_only={})", self.read_only);
        Ok(())
    }

    /// Unmap the segment from this process. Fails with `NotAttached` when
    /// there is no mapping.
    pub fn detach(&mut self) -> Result<()> {
        if !self.is_attached() {
            return Err(IpcError::NotAttached);
        }
        let base = std::mem::replace(&mut self.base, ptr::null_mut());
        self.mapped_len = 0;
        log::debug!("shm {} detaching from {base:p}", self.id());
        sysv::shmdt(base).map_err(|e| match e.raw_os_error() {
            Some(libc::EINVAL) => IpcError::NotAttached,
            _ => translate(e, KIND, Call::Attach),
        })
    }

    pub fn is_attached(&self) -> bool {
        !self.base.is_null()
    }

    /// Whether the current mapping was made with `READ_ONLY`.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Base address of the mapping in this process.
    pub fn address(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.base)
    }

    fn mapped(&self) -> Result<(*mut u8, usize)> {
        if self.base.is_null() {
            return Err(IpcError::NotAttached);
        }
        Ok((self.base, self.mapped_len))
    }

    fn mapped_writable(&self) -> Result<(*mut u8, usize)> {
        let m = self.mapped()?;
        if self.read_only {
            return Err(UsageError::ReadOnlyMapping.into());
        }
        Ok(m)
    }

    // ------------------------------------------------------------------
    // Byte access
    // ------------------------------------------------------------------

    /// Copy bytes out of the segment starting at `offset`.
    ///
    /// `byte_count` of `None`, or a count running past the end, reads up to
    /// the end of the segment. An `offset` at or beyond the end is an error.
    pub fn read(&self, byte_count: Option<usize>, offset: usize) -> Result<Vec<u8>> {
        let (base, size) = self.mapped()?;
        if offset >= size {
            return Err(UsageError::OffsetOutOfRange { offset, size }.into());
        }
        let available = size - offset;
        let count = byte_count.map_or(available, |n| n.min(available));
        Ok(unsafe { sysv::copy_from_mapping(base, offset, count) })
    }

    /// Copy `data` into the segment at `offset`. Nothing is written unless
    /// all of `data` fits.
    pub fn write(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let (base, size) = self.mapped_writable()?;
        if offset > size || data.len() > size - offset {
            return Err(UsageError::WriteOutOfRange {
                offset,
                len: data.len(),
                size,
            }
            .into());
        }
        unsafe { sysv::copy_to_mapping(base, offset, data) };
        Ok(())
    }

    /// The whole mapping as a byte slice, without copying.
    pub fn as_slice(&self) -> Result<&[u8]> {
        let (base, len) = self.mapped()?;
        Ok(unsafe { std::slice::from_raw_parts(base, len) })
    }

    /// The whole mapping as a mutable byte slice, without copying. Writes are
    /// visible to every process attached to the segment.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let (base, len) = self.mapped_writable()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(base, len) })
    }

    // ------------------------------------------------------------------
    // Kernel-side state
    // ------------------------------------------------------------------

    fn stat(&self) -> Result<libc::shmid_ds> {
        self.object.ensure_live()?;
        sysv::shmctl_stat(self.id()).map_err(|e| translate(e, KIND, Call::Operate))
    }

    /// Segment size as reported by the kernel.
    pub fn size(&self) -> Result<usize> {
        Ok(self.stat()?.shm_segsz as usize)
    }

    pub fn number_attached(&self) -> Result<u64> {
        Ok(self.stat()?.shm_nattch as u64)
    }

    pub fn creator_pid(&self) -> Result<i32> {
        Ok(self.stat()?.shm_cpid as i32)
    }

    /// Pid of the last process to attach or detach.
    pub fn last_pid(&self) -> Result<i32> {
        Ok(self.stat()?.shm_lpid as i32)
    }

    pub fn last_attach_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.shm_atime))
    }

    pub fn last_detach_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.shm_dtime))
    }

    pub fn last_change_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.shm_ctime))
    }

    pub fn permissions(&self) -> Result<Permissions> {
        Ok(Permissions::from_raw(&self.stat()?.shm_perm))
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
        let mut ds = self.stat()?;
        apply_perm(&mut ds.shm_perm, field, value);
        sysv::shmctl_set(self.id(), &mut ds).map_err(|e| translate(e, KIND, Call::Operate))
    }

    pub fn get_field(&self, name: &str) -> Result<FieldValue> {
        let entry = lookup(SHARED_MEMORY_FIELDS, name)?;
        Ok(match entry.name {
            "key" => FieldValue::Int(self.key().raw() as i64),
            "id" => FieldValue::Int(self.id() as i64),
            "size" => FieldValue::Int(self.size()? as i64),
            "attached" => FieldValue::Bool(self.is_attached()),
            "read_only" => FieldValue::Bool(self.read_only),
            "number_attached" => FieldValue::Int(self.number_attached()? as i64),
            "creator_pid" => FieldValue::Int(self.creator_pid()? as i64),
            "last_pid" => FieldValue::Int(self.last_pid()? as i64),
            "last_attach_time" => FieldValue::Time(self.last_attach_time()?),
            "last_detach_time" => FieldValue::Time(self.last_detach_time()?),
            "last_change_time" => FieldValue::Time(self.last_change_time()?),
            "mode" => FieldValue::Int(self.mode()? as i64),
            "uid" => FieldValue::Int(self.uid()? as i64),
            "gid" => FieldValue::Int(self.gid()? as i64),
            "cuid" => FieldValue::Int(self.cuid()? as i64),
            "cgid" => FieldValue::Int(self.cgid()? as i64),
            other => return Err(UsageError::UnknownField(other.to_owned()).into()),
        })
    }

    /// Only `mode`, `uid` and `gid` are writable.
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let entry = check_writable(SHARED_MEMORY_FIELDS, name)?;
        let field = PermField::from_name(entry.name).ok_or(UsageError::ReadOnlyField(entry.name))?;
        self.set_perm(field, perm_value(entry, value)?)
    }

    /// Mark the segment for removal. The kernel destroys it once the last
    /// process detaches; this handle's mapping stays usable until then.
    pub fn remove(&self) -> Result<()> {
        self.object.ensure_live()?;
        remove_shared_memory(self.id())?;
        self.object.mark_removed();
        Ok(())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.is_attached() {
            if let Err(e) = self.detach() {
                log::warn!("shm {}: detach on drop failed: {e}", self.id());
            }
        }
    }
}

impl fmt::Display for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.object.fmt(f)
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("key", &self.key())
            .field("id", &self.id())
            .field("address", &self.base)
            .field("mapped_len", &self.mapped_len)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Attach to the segment with kernel id `id` without knowing its key.
pub fn attach(id: i32, address: Option<NonNull<u8>>, flags: AttachFlags) -> Result<SharedMemory> {
    let ds = sysv::shmctl_stat(id).map_err(|e| translate(e, KIND, Call::Operate))?;
    let key = Key::new(sysv::perm_key(&ds.shm_perm));
    let mut shm = SharedMemory::detached(key, id);
    shm.attach(address, flags)?;
    Ok(shm)
}

/// Mark the segment with kernel id `id` for removal.
pub fn remove_shared_memory(id: i32) -> Result<()> {
    log::debug!("removing shared memory id={id}");
    sysv::shmctl_remove(id).map_err(|e| translate(e, KIND, Call::Operate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn attach_flags_map_to_kernel_bits() {
        assert_eq!(AttachFlags::empty().to_raw(), Ok(0));
        assert_eq!(AttachFlags::READ_ONLY.to_raw(), Ok(libc::SHM_RDONLY));
        assert_eq!(
            (AttachFlags::READ_ONLY | AttachFlags::ROUND).to_raw(),
            Ok(libc::SHM_RDONLY | libc::SHM_RND)
        );
    }

    #[test]
    fn linux_flags_follow_capability() {
        let opts = SharedMemoryOptions {
            huge_pages: true,
            no_reserve: true,
            ..SharedMemoryOptions::default()
        };
        if CAPABILITIES.shm_linux_flags {
            assert_eq!(
                opts.creation_flags(),
                Ok(sysv::shm_flags::HUGETLB | sysv::shm_flags::NORESERVE)
            );
            assert_eq!(AttachFlags::REMAP.to_raw(), Ok(sysv::shm_flags::REMAP));
        } else {
            assert_eq!(opts.creation_flags(), Err(UsageError::Unsupported("SHM_HUGETLB")));
            assert_eq!(
                AttachFlags::REMAP.to_raw(),
                Err(UsageError::Unsupported("SHM_REMAP"))
            );
        }
        assert_eq!(SharedMemoryOptions::default().creation_flags(), Ok(0));
    }

    #[test]
    fn detached_handle_refuses_byte_access() {
        let mut shm = SharedMemory::detached(Key::new(1), -1);
        assert_eq!(shm.read(None, 0).unwrap_err().kind(), ErrorKind::NotAttached);
        assert_eq!(shm.write(b"x", 0).unwrap_err().kind(), ErrorKind::NotAttached);
        assert_eq!(shm.as_slice().unwrap_err().kind(), ErrorKind::NotAttached);
        assert_eq!(shm.detach().unwrap_err().kind(), ErrorKind::NotAttached);
        assert!(shm.address().is_none());
    }

    #[test]
    fn only_permission_fields_writable() {
        let mut shm = SharedMemory::detached(Key::new(1), -1);
        for name in ["size", "number_attached", "creator_pid", "last_attach_time", "attached"] {
            let err = shm.set_field(name, FieldValue::Int(1)).unwrap_err();
            assert!(matches!(err, IpcError::Usage(UsageError::ReadOnlyField(_))), "{name}");
        }
        let err = shm.set_field("colour", FieldValue::Int(1)).unwrap_err();
        assert!(matches!(err, IpcError::Usage(UsageError::UnknownField(_))));
    }

    #[test]
    fn default_options() {
        let o = SharedMemoryOptions::default();
        assert_eq!(o.mode, 0o600);
        assert_eq!(o.size, 0);
        assert_eq!(o.fill, b' ');
        assert!(!o.huge_pages && !o.no_reserve);
    }

    #[test]
    fn every_table_field_is_readable() {
        let shm = SharedMemory::detached(Key::new(1), -1);
        for entry in SHARED_MEMORY_FIELDS {
            if let Err(IpcError::Usage(UsageError::UnknownField(name))) = shm.get_field(entry.name) {
                panic!("table field {name} has no getter");
            }
        }
    }
}
