// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Handle lifecycle shared by the three primitives, the ipc_perm snapshot,
// and the per-object field tables used by get_field / set_field.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Existence, IpcError, ObjectKind, Result, UsageError};
use crate::key::Key;
use crate::platform::sysv;

/// This process's reference to one kernel object.
///
/// Key and id are fixed at open time. Dropping an `IpcObject` never removes
/// the kernel object; other handles, here or in other processes, may still use it.
#[derive(Debug)]
pub struct IpcObject {
    kind: ObjectKind,
    key: Key,
    id: i32,
    removed: AtomicBool,
}

impl IpcObject {
    pub(crate) fn new(kind: ObjectKind, key: Key, id: i32) -> Self {
        Self {
            kind,
            key,
            id,
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// True once the object was removed through this handle. Removal by
    /// another handle or process is only seen when the kernel reports it.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Fail fast for a handle whose object this handle already removed; its id
    /// may since have been reused for an unrelated object.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_removed() {
            return Err(IpcError::Existential {
                object: self.kind,
                cause: Existence::Removed,
            });
        }
        Ok(())
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}

impl fmt::Display for IpcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key={}, id={}", self.key, self.id)
    }
}

/// Owner, creator and mode bits of an object, as last reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    pub mode: u32,
    /// Key recorded in the kernel's control block.
    pub key: Key,
}

impl Permissions {
    pub(crate) fn from_raw(perm: &libc::ipc_perm) -> Self {
        Self {
            uid: perm.uid as u32,
            gid: perm.gid as u32,
            cuid: perm.cuid as u32,
            cgid: perm.cgid as u32,
            mode: perm.mode as u32 & 0o777,
            key: Key::new(sysv::perm_key(perm)),
        }
    }
}

/// The writable subset of `ipc_perm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PermField {
    Uid,
    Gid,
    Mode,
}

impl PermField {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "uid" => Some(PermField::Uid),
            "gid" => Some(PermField::Gid),
            "mode" => Some(PermField::Mode),
            _ => None,
        }
    }
}

/// Overwrite one field of a freshly stat'ed `ipc_perm` before IPC_SET.
pub(crate) fn apply_perm(perm: &mut libc::ipc_perm, field: PermField, value: u32) {
    match field {
        PermField::Uid => perm.uid = value as _,
        PermField::Gid => perm.gid = value as _,
        PermField::Mode => perm.mode = (value & 0o777) as _,
    }
}

/// Kernel timestamps are seconds since the epoch; 0 means "never".
pub(crate) fn timestamp(secs: libc::time_t) -> Option<SystemTime> {
    if secs <= 0 {
        None
    } else {
        Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
    }
}

// ---------------------------------------------------------------------------
// Field tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Bool,
    Time,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::Int => "integer",
            FieldType::Bool => "boolean",
            FieldType::Time => "timestamp",
        }
    }
}

/// One entry of a primitive's property table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub writable: bool,
}

impl FieldSpec {
    pub(crate) const fn ro(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            writable: false,
        }
    }

    pub(crate) const fn rw(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            writable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
    Time(Option<SystemTime>),
}

impl FieldValue {
    pub(crate) fn as_int(self, entry: &FieldSpec) -> std::result::Result<i64, UsageError> {
        match self {
            FieldValue::Int(v) => Ok(v),
            _ => Err(UsageError::FieldType {
                field: entry.name,
                expected: entry.ty.name(),
            }),
        }
    }

    pub(crate) fn as_bool(self, entry: &FieldSpec) -> std::result::Result<bool, UsageError> {
        match self {
            FieldValue::Bool(v) => Ok(v),
            _ => Err(UsageError::FieldType {
                field: entry.name,
                expected: entry.ty.name(),
            }),
        }
    }
}

pub(crate) fn lookup<'t>(
    table: &'t [FieldSpec],
    name: &str,
) -> std::result::Result<&'t FieldSpec, UsageError> {
    table
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| UsageError::UnknownField(name.to_string()))
}

/// Resolve `name` for writing; read-only and unknown fields never reach the kernel.
pub(crate) fn check_writable<'t>(
    table: &'t [FieldSpec],
    name: &str,
) -> std::result::Result<&'t FieldSpec, UsageError> {
    let entry = lookup(table, name)?;
    if !entry.writable {
        return Err(UsageError::ReadOnlyField(entry.name));
    }
    Ok(entry)
}

/// Convert a field value to a `u32` perm value, rejecting negatives and overflow.
pub(crate) fn perm_value(entry: &FieldSpec, value: FieldValue) -> std::result::Result<u32, UsageError> {
    let v = value.as_int(entry)?;
    u32::try_from(v).map_err(|_| UsageError::FieldType {
        field: entry.name,
        expected: "non-negative 32-bit integer",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[FieldSpec] = &[
        FieldSpec::ro("id", FieldType::Int),
        FieldSpec::rw("mode", FieldType::Int),
        FieldSpec::rw("block", FieldType::Bool),
    ];

    #[test]
    fn read_only_field_rejected() {
        assert_eq!(
            check_writable(TABLE, "id"),
            Err(UsageError::ReadOnlyField("id"))
        );
    }

    #[test]
    fn unknown_field_rejected() {
        assert_eq!(
            check_writable(TABLE, "color"),
            Err(UsageError::UnknownField("color".into()))
        );
    }

    #[test]
    fn writable_field_found() {
        let entry = check_writable(TABLE, "mode").unwrap();
        assert_eq!(entry.ty, FieldType::Int);
    }

    #[test]
    fn value_type_mismatch() {
        let entry = lookup(TABLE, "block").unwrap();
        assert!(FieldValue::Int(1).as_bool(entry).is_err());
        assert_eq!(FieldValue::Bool(true).as_bool(entry), Ok(true));
    }

    #[test]
    fn perm_value_rejects_negative() {
        let entry = lookup(TABLE, "mode").unwrap();
        assert!(perm_value(entry, FieldValue::Int(-1)).is_err());
        assert_eq!(perm_value(entry, FieldValue::Int(0o644)), Ok(0o644));
    }

    #[test]
    fn zero_timestamp_is_never() {
        assert_eq!(timestamp(0), None);
        assert_eq!(timestamp(10), Some(UNIX_EPOCH + Duration::from_secs(10)));
    }

    #[test]
    fn removed_handle_fails_fast() {
        let obj = IpcObject::new(ObjectKind::Semaphore, Key::new(1), 3);
        assert!(obj.ensure_live().is_ok());
        obj.mark_removed();
        let err = obj.ensure_live().unwrap_err();
        assert!(matches!(
            err,
            IpcError::Existential {
                cause: Existence::Removed,
                ..
            }
        ));
        assert_eq!(obj.to_string(), "Key=1, id=3");
    }

    #[test]
    fn apply_perm_masks_mode() {
        let mut perm: libc::ipc_perm = unsafe { std::mem::zeroed() };
        apply_perm(&mut perm, PermField::Mode, 0o100644);
        assert_eq!(perm.mode as u32, 0o644);
        apply_perm(&mut perm, PermField::Uid, 1000);
        assert_eq!(perm.uid as u32, 1000);
    }
}
