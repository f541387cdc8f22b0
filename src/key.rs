// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Key resolution: turns (key request, open flags, mode) into exactly one
// kernel get call, so create-or-open races are arbitrated by the kernel.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::{c_int, key_t};
use rand::Rng;

use crate::error::{translate, Call, ObjectKind, Result, UsageError};
use crate::platform::{sysv, CAPABILITIES};

/// Integer naming an IPC object. Semaphore, shared memory and queue keys
/// live in separate namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(key_t);

impl Key {
    /// `IPC_PRIVATE`: ask the kernel for an object no other key can reach.
    pub const PRIVATE: Key = Key(libc::IPC_PRIVATE);

    pub const fn new(raw: key_t) -> Self {
        Key(raw)
    }

    pub const fn raw(self) -> key_t {
        self.0
    }

    pub fn is_private(self) -> bool {
        self == Key::PRIVATE
    }

    /// Random key in `1..=i16::MAX`; that range is valid whatever the width of `key_t`.
    fn random() -> Self {
        let raw = rand::thread_rng().gen_range(1..=i16::MAX as key_t);
        Key(raw)
    }
}

impl From<key_t> for Key {
    fn from(raw: key_t) -> Self {
        Key(raw)
    }
}

impl TryFrom<i64> for Key {
    type Error = UsageError;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        if value < CAPABILITIES.key_min || value > CAPABILITIES.key_max {
            return Err(UsageError::KeyOutOfRange {
                key: value,
                min: CAPABILITIES.key_min,
                max: CAPABILITIES.key_max,
            });
        }
        Ok(Key(value as key_t))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which key a create/open call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequest {
    /// A caller-chosen key.
    Key(Key),
    /// `IPC_PRIVATE`.
    Private,
    /// A randomly drawn key, redrawn until the kernel accepts it as new.
    Generate,
}

impl From<Key> for KeyRequest {
    fn from(key: Key) -> Self {
        if key.is_private() {
            KeyRequest::Private
        } else {
            KeyRequest::Key(key)
        }
    }
}

impl From<key_t> for KeyRequest {
    fn from(raw: key_t) -> Self {
        KeyRequest::from(Key(raw))
    }
}

bitflags::bitflags! {
    /// Create/open intent passed to every constructor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        /// Create the object if the key is unused.
        const CREATE = 0b01;
        /// Fail if the key is already in use. Only valid with `CREATE`.
        const EXCLUSIVE = 0b10;
        const CREATE_EXCLUSIVE = Self::CREATE.bits() | Self::EXCLUSIVE.bits();
    }
}

impl OpenFlags {
    /// Whether a successful get with these flags means this call created the object.
    pub fn creates_new(self) -> bool {
        self.contains(OpenFlags::CREATE_EXCLUSIVE)
    }

    pub(crate) fn to_raw(self) -> c_int {
        let mut raw = 0;
        if self.contains(OpenFlags::CREATE) {
            raw |= libc::IPC_CREAT;
        }
        if self.contains(OpenFlags::EXCLUSIVE) {
            raw |= libc::IPC_EXCL;
        }
        raw
    }
}

/// Reject flag/key combinations that cannot be expressed to the kernel.
pub(crate) fn validate(request: KeyRequest, flags: OpenFlags) -> std::result::Result<(), UsageError> {
    if flags.contains(OpenFlags::EXCLUSIVE) && !flags.contains(OpenFlags::CREATE) {
        return Err(UsageError::ExclusiveWithoutCreate);
    }
    let private = match request {
        KeyRequest::Key(key) => key.is_private(),
        KeyRequest::Private | KeyRequest::Generate => true,
    };
    if private && !flags.creates_new() {
        return Err(UsageError::PrivateKeyNeedsExclusive);
    }
    Ok(())
}

/// Issue the kernel get call for `request`.
///
/// `get` receives the raw key and `flags | mode`, and is called exactly once
/// unless the request is `Generate`, in which case a fresh key is drawn each
/// time the kernel answers EEXIST.
pub(crate) fn resolve<F>(
    request: KeyRequest,
    flags: OpenFlags,
    mode: u32,
    object: ObjectKind,
    mut get: F,
) -> Result<(Key, c_int)>
where
    F: FnMut(key_t, c_int) -> io::Result<c_int>,
{
    validate(request, flags)?;
    let raw_flags = flags.to_raw() | (mode & 0o777) as c_int;

    let key = match request {
        KeyRequest::Key(key) => key,
        KeyRequest::Private => Key::PRIVATE,
        KeyRequest::Generate => loop {
            let key = Key::random();
            log::trace!("{object} get: key={key} flags={raw_flags:#o} (generated)");
            match get(key.raw(), raw_flags) {
                Ok(id) => return Ok((key, id)),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => continue,
                Err(e) => return Err(translate(e, object, Call::Get)),
            }
        },
    };

    log::trace!("{object} get: key={key} flags={raw_flags:#o}");
    let id = get(key.raw(), raw_flags).map_err(|e| translate(e, object, Call::Get))?;
    Ok((key, id))
}

/// Derive a key from an existing file and an 8-bit project id (`ftok(3)`).
///
/// Only the low 8 bits of `project_id` are used by the kernel, and distinct
/// paths may still collide.
pub fn ftok<P: AsRef<Path>>(path: P, project_id: u8) -> io::Result<Key> {
    if project_id == 0 {
        log::warn!("ftok called with project id 0; keys derived this way collide easily");
    }
    let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    sysv::ftok(&c_path, project_id).map(Key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Existence, IpcError};

    #[test]
    fn exclusive_requires_create() {
        assert_eq!(
            validate(KeyRequest::Key(Key::new(42)), OpenFlags::EXCLUSIVE),
            Err(UsageError::ExclusiveWithoutCreate)
        );
    }

    #[test]
    fn private_and_generated_need_create_exclusive() {
        for req in [
            KeyRequest::Private,
            KeyRequest::Generate,
            KeyRequest::Key(Key::PRIVATE),
        ] {
            assert_eq!(
                validate(req, OpenFlags::CREATE),
                Err(UsageError::PrivateKeyNeedsExclusive)
            );
            assert_eq!(
                validate(req, OpenFlags::empty()),
                Err(UsageError::PrivateKeyNeedsExclusive)
            );
            assert!(validate(req, OpenFlags::CREATE_EXCLUSIVE).is_ok());
        }
    }

    #[test]
    fn raw_flags() {
        assert_eq!(OpenFlags::empty().to_raw(), 0);
        assert_eq!(OpenFlags::CREATE.to_raw(), libc::IPC_CREAT);
        assert_eq!(
            OpenFlags::CREATE_EXCLUSIVE.to_raw(),
            libc::IPC_CREAT | libc::IPC_EXCL
        );
    }

    #[test]
    fn key_private_maps_to_private_request() {
        assert_eq!(KeyRequest::from(Key::PRIVATE), KeyRequest::Private);
        assert_eq!(KeyRequest::from(7i32), KeyRequest::Key(Key::new(7)));
    }

    #[test]
    fn key_range_checked() {
        assert!(Key::try_from(CAPABILITIES.key_max + 1).is_err());
        assert!(Key::try_from(CAPABILITIES.key_min - 1).is_err());
        assert_eq!(Key::try_from(1234i64).unwrap().raw(), 1234);
    }

    #[test]
    fn random_keys_in_range() {
        for _ in 0..1000 {
            let k = Key::random().raw();
            assert!(k >= 1 && k <= i16::MAX as key_t);
        }
    }

    #[test]
    fn resolve_generate_retries_on_eexist() {
        let mut calls = 0;
        let (key, id) = resolve(
            KeyRequest::Generate,
            OpenFlags::CREATE_EXCLUSIVE,
            0o600,
            ObjectKind::Semaphore,
            |_, flags| {
                assert_eq!(flags & 0o777, 0o600);
                calls += 1;
                if calls < 3 {
                    Err(io::Error::from_raw_os_error(libc::EEXIST))
                } else {
                    Ok(99)
                }
            },
        )
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(id, 99);
        assert!(!key.is_private());
    }

    #[test]
    fn resolve_explicit_key_calls_once() {
        let mut calls = 0;
        let err = resolve(
            KeyRequest::Key(Key::new(5)),
            OpenFlags::CREATE_EXCLUSIVE,
            0o600,
            ObjectKind::MessageQueue,
            |key, _| {
                assert_eq!(key, 5);
                calls += 1;
                Err(io::Error::from_raw_os_error(libc::EEXIST))
            },
        )
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(
            err,
            IpcError::Existential {
                cause: Existence::AlreadyExists,
                ..
            }
        ));
    }

    #[test]
    fn resolve_rejects_before_calling_kernel() {
        let r = resolve(
            KeyRequest::Generate,
            OpenFlags::CREATE,
            0o600,
            ObjectKind::SharedMemory,
            |_, _| panic!("kernel must not be called"),
        );
        assert!(matches!(
            r,
            Err(IpcError::Usage(UsageError::PrivateKeyNeedsExclusive))
        ));
    }

    #[test]
    fn ftok_missing_path_fails() {
        assert!(ftok("/definitely/not/a/real/path/sysv_ipc", 1).is_err());
    }

    #[test]
    fn ftok_is_stable() {
        let a = ftok("/", 7).unwrap();
        let b = ftok("/", 7).unwrap();
        assert_eq!(a, b);
    }
}
