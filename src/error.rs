// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Error taxonomy shared by semaphores, shared memory and message queues,
// and the single errno -> taxonomy translation table.

use std::fmt;
use std::io;

/// The kind of kernel object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Semaphore,
    SharedMemory,
    MessageQueue,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Semaphore => "semaphore",
            ObjectKind::SharedMemory => "shared memory segment",
            ObjectKind::MessageQueue => "message queue",
        })
    }
}

/// Why an existential error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    /// No object with the requested key or id exists.
    NotFound,
    /// Exclusive creation was requested but the key is already in use.
    AlreadyExists,
    /// The object was removed, possibly while the caller was blocked on it.
    Removed,
}

impl fmt::Display for Existence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Existence::NotFound => "does not exist",
            Existence::AlreadyExists => "already exists",
            Existence::Removed => "was removed",
        })
    }
}

/// Errors detected by this crate before any syscall is issued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("the delta must be non-zero")]
    ZeroDelta,
    #[error("the delta {0} does not fit in a semaphore operation")]
    DeltaOutOfRange(i32),
    #[error("the message type must be > 0, got {0}")]
    NonPositiveType(i64),
    #[error("the message type {0} does not fit in a C long")]
    TypeOutOfRange(i64),
    #[error("offset {offset} must be less than the segment size {size}")]
    OffsetOutOfRange { offset: usize, size: usize },
    #[error("writing {len} bytes at offset {offset} runs past the segment end ({size})")]
    WriteOutOfRange { offset: usize, len: usize, size: usize },
    #[error("field '{0}' is read-only")]
    ReadOnlyField(&'static str),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{field}' expects a {expected} value")]
    FieldType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("EXCLUSIVE must be combined with CREATE")]
    ExclusiveWithoutCreate,
    #[error("a private or generated key requires CREATE | EXCLUSIVE")]
    PrivateKeyNeedsExclusive,
    #[error("key {key} is outside {min}..={max}")]
    KeyOutOfRange { key: i64, min: i64, max: i64 },
    #[error("the value must remain between 0 and {max} (SEMAPHORE_VALUE_MAX)")]
    ValueOutOfRange { max: i32 },
    #[error("the message length {len} exceeds the maximum message size {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("write attempt on a read-only mapping")]
    ReadOnlyMapping,
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// The closed set of error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Existential,
    Permissions,
    Busy,
    NotAttached,
    Internal,
    Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("the {object} {cause}")]
    Existential { object: ObjectKind, cause: Existence },

    #[error("permission denied on {object}")]
    Permissions {
        object: ObjectKind,
        #[source]
        source: io::Error,
    },

    #[error("the {object} is busy")]
    Busy { object: ObjectKind },

    #[error("the shared memory segment is not attached")]
    NotAttached,

    #[error("{object}: {source}")]
    Internal {
        object: ObjectKind,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl IpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpcError::Existential { .. } => ErrorKind::Existential,
            IpcError::Permissions { .. } => ErrorKind::Permissions,
            IpcError::Busy { .. } => ErrorKind::Busy,
            IpcError::NotAttached => ErrorKind::NotAttached,
            IpcError::Internal { .. } => ErrorKind::Internal,
            IpcError::Usage(_) => ErrorKind::Usage,
        }
    }

    /// The platform errno behind this error, when one exists.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IpcError::Permissions { source, .. } | IpcError::Internal { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }

    pub fn is_existential(&self) -> bool {
        self.kind() == ErrorKind::Existential
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Which family of syscall produced an errno.
///
/// `EINVAL` means different things depending on the call: on an id-based
/// operation it means the id is stale, on a get/attach call it means one of
/// the caller's arguments was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    /// semget / shmget / msgget.
    Get,
    /// semop, semctl, shmctl, msgsnd, msgrcv, msgctl on an existing id.
    Operate,
    /// shmat / shmdt.
    Attach,
}

/// Map a kernel failure to the taxonomy.
pub(crate) fn translate(err: io::Error, object: ObjectKind, call: Call) -> IpcError {
    let errno = match err.raw_os_error() {
        Some(e) => e,
        None => return IpcError::Internal { object, source: err },
    };
    match errno {
        libc::ENOENT => IpcError::Existential {
            object,
            cause: Existence::NotFound,
        },
        libc::EEXIST => IpcError::Existential {
            object,
            cause: Existence::AlreadyExists,
        },
        libc::EIDRM => IpcError::Existential {
            object,
            cause: Existence::Removed,
        },
        libc::EINVAL if call == Call::Operate => IpcError::Existential {
            object,
            cause: Existence::NotFound,
        },
        libc::EACCES | libc::EPERM => IpcError::Permissions { object, source: err },
        libc::EAGAIN | libc::ENOMSG => IpcError::Busy { object },
        libc::ERANGE => IpcError::Usage(UsageError::ValueOutOfRange {
            max: crate::platform::CAPABILITIES.semaphore_value_max,
        }),
        _ => IpcError::Internal { object, source: err },
    }
}
