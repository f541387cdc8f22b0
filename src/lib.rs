// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Safe Rust bindings to System V IPC: semaphores, shared memory segments and
// message queues, addressed by integer keys.
//
// Thread safety is defined per kernel object, not per handle: the kernel
// serializes operations on one semaphore or queue, and blocking calls take
// `&self` without holding any lock of this crate. Handle-local state (block
// mode, the shared memory mapping) changes only through `&mut self`.
//
// No handle removes its kernel object on drop; call `remove()` or one of the
// `remove_*` functions explicitly.

#[cfg(not(unix))]
compile_error!("sysv_ipc requires a Unix target with System V IPC");

mod platform;
pub use platform::{page_size, Capabilities, CAPABILITIES};

pub mod error;
pub use error::{ErrorKind, Existence, IpcError, ObjectKind, Result, UsageError};

mod handle;
pub use handle::{FieldSpec, FieldType, FieldValue, Permissions};

mod key;
pub use key::{ftok, Key, KeyRequest, OpenFlags};

mod semaphore;
pub use semaphore::{
    remove_semaphore, Semaphore, SemaphoreGuard, SemaphoreOptions, SEMAPHORE_FIELDS,
};

mod shm;
pub use shm::{
    attach, remove_shared_memory, AttachFlags, SharedMemory, SharedMemoryOptions,
    SHARED_MEMORY_FIELDS,
};

mod message_queue;
pub use message_queue::{
    remove_message_queue, MessageQueue, MessageQueueOptions, TypeSelector,
    MESSAGE_QUEUE_FIELDS, QUEUE_MESSAGE_SIZE_DEFAULT, QUEUE_MESSAGE_SIZE_MAX,
};

mod scoped_access;
pub use scoped_access::ScopedAccess;

/// Smallest key the kernel accepts.
pub const KEY_MIN: i64 = CAPABILITIES.key_min;

/// Largest key the kernel accepts.
pub const KEY_MAX: i64 = CAPABILITIES.key_max;

/// Largest value a semaphore can hold.
pub const SEMAPHORE_VALUE_MAX: i32 = CAPABILITIES.semaphore_value_max;

/// Whether timed semaphore waits are enforced by the kernel. When false they
/// are emulated with a polling loop.
pub const SEMAPHORE_TIMEOUT_SUPPORTED: bool = CAPABILITIES.semtimedop;
