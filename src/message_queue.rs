// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// System V message queue handle: typed send/receive plus queue statistics.

use std::fmt;
use std::time::SystemTime;

use libc::c_long;

use crate::error::{translate, Call, ObjectKind, Result, UsageError};
use crate::handle::{
    self, apply_perm, check_writable, lookup, perm_value, FieldSpec, FieldType, FieldValue,
    IpcObject, PermField, Permissions,
};
use crate::key::{self, Key, KeyRequest, OpenFlags};
use crate::platform::sysv;

const KIND: ObjectKind = ObjectKind::MessageQueue;

/// Upper bound for a handle's `max_message_size`. The receive buffer also
/// holds the type tag, so the bound leaves room for it.
pub const QUEUE_MESSAGE_SIZE_MAX: usize = isize::MAX as usize - sysv::MTYPE_LEN;

/// Default receive buffer size of a new handle.
pub const QUEUE_MESSAGE_SIZE_DEFAULT: usize = 2048;

/// Property table for [`MessageQueue::get_field`] / [`MessageQueue::set_field`].
pub const MESSAGE_QUEUE_FIELDS: &[FieldSpec] = &[
    FieldSpec::ro("key", FieldType::Int),
    FieldSpec::ro("id", FieldType::Int),
    FieldSpec::rw("max_message_size", FieldType::Int),
    FieldSpec::rw("max_size", FieldType::Int),
    FieldSpec::ro("current_messages", FieldType::Int),
    FieldSpec::ro("last_send_time", FieldType::Time),
    FieldSpec::ro("last_receive_time", FieldType::Time),
    FieldSpec::ro("last_change_time", FieldType::Time),
    FieldSpec::ro("last_send_pid", FieldType::Int),
    FieldSpec::ro("last_receive_pid", FieldType::Int),
    FieldSpec::rw("mode", FieldType::Int),
    FieldSpec::rw("uid", FieldType::Int),
    FieldSpec::rw("gid", FieldType::Int),
    FieldSpec::ro("cuid", FieldType::Int),
    FieldSpec::ro("cgid", FieldType::Int),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueueOptions {
    pub mode: u32,
    /// Largest payload this handle sends or receives.
    pub max_message_size: usize,
}

impl Default for MessageQueueOptions {
    fn default() -> Self {
        Self {
            mode: 0o600,
            max_message_size: QUEUE_MESSAGE_SIZE_DEFAULT,
        }
    }
}

/// Which message `receive` takes off the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeSelector {
    /// The oldest message of any type.
    #[default]
    Any,
    /// The oldest message of exactly this type.
    Exact(i64),
    /// The oldest message of the lowest type that is `<=` this bound.
    ///
    /// Some kernels have historically been unreliable here; the selection is
    /// whatever the host kernel's `msgrcv` does with a negative `msgtyp`.
    AtMost(i64),
}

impl TypeSelector {
    fn to_raw(self) -> std::result::Result<c_long, UsageError> {
        let raw = match self {
            TypeSelector::Any => return Ok(0),
            TypeSelector::Exact(t) => {
                check_type(t)?;
                t
            }
            TypeSelector::AtMost(t) => {
                check_type(t)?;
                -t
            }
        };
        c_long::try_from(raw).map_err(|_| UsageError::TypeOutOfRange(raw))
    }
}

/// `msgrcv` convention: 0 is any type, positive is an exact type, negative
/// is "lowest type up to |n|".
impl TryFrom<i64> for TypeSelector {
    type Error = UsageError;

    fn try_from(raw: i64) -> std::result::Result<Self, Self::Error> {
        match raw {
            0 => Ok(TypeSelector::Any),
            n if n > 0 => Ok(TypeSelector::Exact(n)),
            n => n
                .checked_neg()
                .map(TypeSelector::AtMost)
                .ok_or(UsageError::TypeOutOfRange(n)),
        }
    }
}

fn check_type(mtype: i64) -> std::result::Result<(), UsageError> {
    if mtype <= 0 {
        return Err(UsageError::NonPositiveType(mtype));
    }
    Ok(())
}

fn message_type(mtype: i64) -> std::result::Result<c_long, UsageError> {
    check_type(mtype)?;
    c_long::try_from(mtype).map_err(|_| UsageError::TypeOutOfRange(mtype))
}

fn check_max_message_size(size: usize) -> std::result::Result<(), UsageError> {
    if size > QUEUE_MESSAGE_SIZE_MAX {
        return Err(UsageError::MessageTooLarge {
            len: size,
            max: QUEUE_MESSAGE_SIZE_MAX,
        });
    }
    Ok(())
}

/// A handle to a kernel message queue.
///
/// `send` and `receive` take `&self` and hold nothing while blocked, so one
/// handle can serve several threads.
pub struct MessageQueue {
    object: IpcObject,
    max_message_size: usize,
}

impl MessageQueue {
    pub fn open<K: Into<KeyRequest>>(
        key: K,
        flags: OpenFlags,
        options: MessageQueueOptions,
    ) -> Result<Self> {
        check_max_message_size(options.max_message_size)?;
        let (key, id) = key::resolve(key.into(), flags, options.mode, KIND, sysv::msgget)?;
        let mq = Self {
            object: IpcObject::new(KIND, key, id),
            max_message_size: options.max_message_size,
        };
        log::debug!("message queue opened: {}", mq.object);
        Ok(mq)
    }

    pub fn open_existing<K: Into<KeyRequest>>(key: K) -> Result<Self> {
        Self::open(key, OpenFlags::empty(), MessageQueueOptions::default())
    }

    /// Create a new queue under a generated key.
    pub fn create() -> Result<Self> {
        Self::open(
            KeyRequest::Generate,
            OpenFlags::CREATE_EXCLUSIVE,
            MessageQueueOptions::default(),
        )
    }

    pub fn key(&self) -> Key {
        self.object.key()
    }

    pub fn id(&self) -> i32 {
        self.object.id()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn set_max_message_size(&mut self, size: usize) -> Result<()> {
        check_max_message_size(size)?;
        self.max_message_size = size;
        Ok(())
    }

    /// Enqueue `payload` tagged with `mtype` (which must be > 0).
    ///
    /// When the queue is full this waits for room if `block` is set and
    /// fails with `Busy` otherwise.
    pub fn send(&self, payload: &[u8], mtype: i64, block: bool) -> Result<()> {
        let mtype = message_type(mtype)?;
        if payload.len() > self.max_message_size {
            return Err(UsageError::MessageTooLarge {
                len: payload.len(),
                max: self.max_message_size,
            }
            .into());
        }
        self.object.ensure_live()?;

        let flags = if block { 0 } else { libc::IPC_NOWAIT };
        log::trace!(
            "msgsnd: id={} type={mtype} len={} flags={flags:#x}",
            self.id(),
            payload.len()
        );
        sysv::msgsnd(self.id(), mtype, payload, flags)
            .map_err(|e| translate(e, KIND, Call::Operate))
    }

    /// Take one message off the queue, returning its payload and type.
    ///
    /// A message longer than `max_message_size` is left on the queue and
    /// reported as an internal error (`E2BIG`). A receive buffer of
    /// `max_message_size` bytes that cannot be allocated is an internal
    /// error (`ENOMEM`).
    pub fn receive(&self, selector: TypeSelector, block: bool) -> Result<(Vec<u8>, i64)> {
        let raw_selector = selector.to_raw()?;
        self.object.ensure_live()?;

        let flags = if block { 0 } else { libc::IPC_NOWAIT };
        log::trace!(
            "msgrcv: id={} selector={raw_selector} max={} flags={flags:#x}",
            self.id(),
            self.max_message_size
        );
        let (payload, mtype) = sysv::msgrcv(self.id(), self.max_message_size, raw_selector, flags)
            .map_err(|e| translate(e, KIND, Call::Operate))?;
        Ok((payload, mtype as i64))
    }

    // ------------------------------------------------------------------
    // Kernel-side state
    // ------------------------------------------------------------------

    fn stat(&self) -> Result<libc::msqid_ds> {
        self.object.ensure_live()?;
        sysv::msgctl_stat(self.id()).map_err(|e| translate(e, KIND, Call::Operate))
    }

    fn update<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut libc::msqid_ds),
    {
        let mut ds = self.stat()?;
        edit(&mut ds);
        sysv::msgctl_set(self.id(), &mut ds).map_err(|e| translate(e, KIND, Call::Operate))
    }

    /// Messages currently on the queue.
    pub fn current_messages(&self) -> Result<u64> {
        Ok(self.stat()?.msg_qnum as u64)
    }

    /// Byte capacity of the queue (`msg_qbytes`).
    pub fn max_size(&self) -> Result<u64> {
        Ok(self.stat()?.msg_qbytes as u64)
    }

    /// Change the queue's byte capacity. Raising it above the system limit
    /// needs privileges; the kernel answers with a permissions error otherwise.
    pub fn set_max_size(&self, bytes: u64) -> Result<()> {
        self.update(|ds| ds.msg_qbytes = bytes as _)
    }

    pub fn last_send_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.msg_stime))
    }

    pub fn last_receive_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.msg_rtime))
    }

    pub fn last_change_time(&self) -> Result<Option<SystemTime>> {
        Ok(handle::timestamp(self.stat()?.msg_ctime))
    }

    pub fn last_send_pid(&self) -> Result<i32> {
        Ok(self.stat()?.msg_lspid as i32)
    }

    pub fn last_receive_pid(&self) -> Result<i32> {
        Ok(self.stat()?.msg_lrpid as i32)
    }

    pub fn permissions(&self) -> Result<Permissions> {
        Ok(Permissions::from_raw(&self.stat()?.msg_perm))
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
        self.update(|ds| apply_perm(&mut ds.msg_perm, field, value))
    }

    pub fn get_field(&self, name: &str) -> Result<FieldValue> {
        let entry = lookup(MESSAGE_QUEUE_FIELDS, name)?;
        Ok(match entry.name {
            "key" => FieldValue::Int(self.key().raw() as i64),
            "id" => FieldValue::Int(self.id() as i64),
            "max_message_size" => FieldValue::Int(self.max_message_size as i64),
            "max_size" => FieldValue::Int(self.max_size()? as i64),
            "current_messages" => FieldValue::Int(self.current_messages()? as i64),
            "last_send_time" => FieldValue::Time(self.last_send_time()?),
            "last_receive_time" => FieldValue::Time(self.last_receive_time()?),
            "last_change_time" => FieldValue::Time(self.last_change_time()?),
            "last_send_pid" => FieldValue::Int(self.last_send_pid()? as i64),
            "last_receive_pid" => FieldValue::Int(self.last_receive_pid()? as i64),
            "mode" => FieldValue::Int(self.mode()? as i64),
            "uid" => FieldValue::Int(self.uid()? as i64),
            "gid" => FieldValue::Int(self.gid()? as i64),
            "cuid" => FieldValue::Int(self.cuid()? as i64),
            "cgid" => FieldValue::Int(self.cgid()? as i64),
            other => return Err(UsageError::UnknownField(other.to_owned()).into()),
        })
    }

    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let entry = check_writable(MESSAGE_QUEUE_FIELDS, name)?;
        match entry.name {
            "max_message_size" => {
                let size = usize::try_from(value.as_int(entry)?).map_err(|_| UsageError::FieldType {
                    field: entry.name,
                    expected: "non-negative integer",
                })?;
                self.set_max_message_size(size)
            }
            "max_size" => {
                let bytes = u64::try_from(value.as_int(entry)?).map_err(|_| UsageError::FieldType {
                    field: entry.name,
                    expected: "non-negative integer",
                })?;
                self.set_max_size(bytes)
            }
            other => {
                let field = PermField::from_name(other).ok_or(UsageError::ReadOnlyField(entry.name))?;
                self.set_perm(field, perm_value(entry, value)?)
            }
        }
    }

    /// Remove the queue. Blocked senders and receivers wake with an
    /// existential error.
    pub fn remove(&self) -> Result<()> {
        self.object.ensure_live()?;
        remove_message_queue(self.id())?;
        self.object.mark_removed();
        Ok(())
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.object.fmt(f)
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("key", &self.key())
            .field("id", &self.id())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

/// Remove the queue with kernel id `id`.
pub fn remove_message_queue(id: i32) -> Result<()> {
    log::debug!("removing message queue id={id}");
    sysv::msgctl_remove(id).map_err(|e| translate(e, KIND, Call::Operate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpcError;

    #[test]
    fn every_table_field_is_readable() {
        let mq = MessageQueue {
            object: IpcObject::new(KIND, Key::new(1), -1),
            max_message_size: QUEUE_MESSAGE_SIZE_DEFAULT,
        };
        for entry in MESSAGE_QUEUE_FIELDS {
            if let Err(IpcError::Usage(UsageError::UnknownField(name))) = mq.get_field(entry.name) {
                panic!("table field {name} has no getter");
            }
        }
    }

    #[test]
    fn size_cap_leaves_room_for_type_tag() {
        assert!(QUEUE_MESSAGE_SIZE_MAX.checked_add(sysv::MTYPE_LEN).is_some());
        assert_eq!(QUEUE_MESSAGE_SIZE_MAX + sysv::MTYPE_LEN, isize::MAX as usize);
    }

    #[test]
    fn selector_from_raw() {
        assert_eq!(TypeSelector::try_from(0), Ok(TypeSelector::Any));
        assert_eq!(TypeSelector::try_from(4), Ok(TypeSelector::Exact(4)));
        assert_eq!(TypeSelector::try_from(-3), Ok(TypeSelector::AtMost(3)));
        assert_eq!(
            TypeSelector::try_from(i64::MIN),
            Err(UsageError::TypeOutOfRange(i64::MIN))
        );
    }

    #[test]
    fn selector_to_raw() {
        assert_eq!(TypeSelector::Any.to_raw(), Ok(0));
        assert_eq!(TypeSelector::Exact(7).to_raw(), Ok(7));
        assert_eq!(TypeSelector::AtMost(3).to_raw(), Ok(-3));
        assert_eq!(
            TypeSelector::Exact(0).to_raw(),
            Err(UsageError::NonPositiveType(0))
        );
        assert_eq!(
            TypeSelector::AtMost(-1).to_raw(),
            Err(UsageError::NonPositiveType(-1))
        );
    }

    #[test]
    fn message_type_must_be_positive() {
        assert_eq!(message_type(0), Err(UsageError::NonPositiveType(0)));
        assert_eq!(message_type(-5), Err(UsageError::NonPositiveType(-5)));
        assert_eq!(message_type(1), Ok(1));
    }

    #[test]
    fn read_only_fields_rejected_before_kernel() {
        for name in ["current_messages", "last_send_pid", "last_change_time", "cuid"] {
            assert!(matches!(
                check_writable(MESSAGE_QUEUE_FIELDS, name),
                Err(UsageError::ReadOnlyField(_))
            ));
        }
    }

    #[test]
    fn default_options() {
        let o = MessageQueueOptions::default();
        assert_eq!(o.mode, 0o600);
        assert_eq!(o.max_message_size, 2048);
    }
}
