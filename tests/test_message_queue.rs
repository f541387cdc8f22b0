// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Integration tests for System V message queues.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sysv_ipc::{
    ErrorKind, Existence, FieldValue, IpcError, KeyRequest, MessageQueue, MessageQueueOptions,
    OpenFlags, TypeSelector, UsageError, QUEUE_MESSAGE_SIZE_MAX,
};

fn fresh() -> MessageQueue {
    MessageQueue::create().expect("create queue")
}

// ========== Creation ==========

#[test]
fn create_and_open_existing() {
    let mq = fresh();
    let other = MessageQueue::open_existing(mq.key()).unwrap();
    assert_eq!(other.id(), mq.id());
    assert_eq!(mq.current_messages().unwrap(), 0);
    mq.remove().unwrap();
}

#[test]
fn exclusive_create_on_used_key_fails() {
    let mq = fresh();
    let err = MessageQueue::open(
        mq.key(),
        OpenFlags::CREATE_EXCLUSIVE,
        MessageQueueOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        IpcError::Existential {
            cause: Existence::AlreadyExists,
            ..
        }
    ));
    assert_eq!(mq.current_messages().unwrap(), 0);
    mq.remove().unwrap();
}

#[test]
fn private_key_needs_exclusive() {
    let err = MessageQueue::open(
        KeyRequest::Private,
        OpenFlags::empty(),
        MessageQueueOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        IpcError::Usage(UsageError::PrivateKeyNeedsExclusive)
    ));
}

// ========== Send / receive ==========

#[test]
fn negative_selector_picks_lowest_qualifying_type() {
    let mq = fresh();
    mq.send(b"x", 5, true).unwrap();
    mq.send(b"y", 2, true).unwrap();

    let (payload, mtype) = mq.receive(TypeSelector::AtMost(3), true).unwrap();
    assert_eq!(payload, b"y");
    assert_eq!(mtype, 2);

    let (payload, mtype) = mq.receive(TypeSelector::Any, true).unwrap();
    assert_eq!(payload, b"x");
    assert_eq!(mtype, 5);
    mq.remove().unwrap();
}

#[test]
fn any_selector_is_fifo_and_count_decrements() {
    let mq = fresh();
    let sent: Vec<(Vec<u8>, i64)> = (1..=5)
        .map(|t| (format!("message {t}").into_bytes(), 10 - t))
        .collect();
    for (payload, mtype) in &sent {
        mq.send(payload, *mtype, true).unwrap();
    }
    assert_eq!(mq.current_messages().unwrap(), 5);

    for (i, expected) in sent.iter().enumerate() {
        let got = mq.receive(TypeSelector::Any, true).unwrap();
        assert_eq!(&got, expected);
        assert_eq!(mq.current_messages().unwrap(), (4 - i) as u64);
    }
    mq.remove().unwrap();
}

#[test]
fn exact_selector_skips_other_types() {
    let mq = fresh();
    mq.send(b"one", 1, true).unwrap();
    mq.send(b"two", 2, true).unwrap();
    mq.send(b"two again", 2, true).unwrap();

    assert_eq!(mq.receive(TypeSelector::Exact(2), true).unwrap().0, b"two");
    assert_eq!(mq.receive(TypeSelector::Exact(2), true).unwrap().0, b"two again");
    assert!(mq.receive(TypeSelector::Exact(2), false).unwrap_err().is_busy());
    assert_eq!(mq.receive(TypeSelector::Any, false).unwrap().0, b"one");
    mq.remove().unwrap();
}

#[test]
fn empty_payload_round_trips() {
    let mq = fresh();
    mq.send(b"", 7, true).unwrap();
    assert_eq!(mq.receive(TypeSelector::Any, true).unwrap(), (Vec::new(), 7));
    mq.remove().unwrap();
}

#[test]
fn non_blocking_receive_on_empty_is_busy() {
    let mq = fresh();
    let start = Instant::now();
    let err = mq.receive(TypeSelector::Any, false).unwrap_err();
    assert!(err.is_busy());
    assert!(start.elapsed() < Duration::from_millis(50));
    mq.remove().unwrap();
}

#[test]
fn non_positive_type_rejected_before_send() {
    let mq = fresh();
    for t in [0, -1] {
        let err = mq.send(b"x", t, true).unwrap_err();
        assert!(matches!(err, IpcError::Usage(UsageError::NonPositiveType(_))));
    }
    let err = mq.receive(TypeSelector::Exact(0), false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(mq.current_messages().unwrap(), 0);
    mq.remove().unwrap();
}

#[test]
fn oversized_message_rejected() {
    let mq = MessageQueue::open(
        KeyRequest::Generate,
        OpenFlags::CREATE_EXCLUSIVE,
        MessageQueueOptions {
            max_message_size: 16,
            ..MessageQueueOptions::default()
        },
    )
    .unwrap();
    let err = mq.send(&[0u8; 17], 1, true).unwrap_err();
    assert!(matches!(
        err,
        IpcError::Usage(UsageError::MessageTooLarge { len: 17, max: 16 })
    ));
    mq.send(&[0u8; 16], 1, true).unwrap();
    mq.remove().unwrap();
}

#[test]
fn message_larger_than_receive_buffer_stays_queued() {
    let mut mq = fresh();
    mq.send(&[1u8; 64], 3, true).unwrap();

    mq.set_max_message_size(8).unwrap();
    let err = mq.receive(TypeSelector::Any, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(mq.current_messages().unwrap(), 1);

    mq.set_max_message_size(64).unwrap();
    assert_eq!(mq.receive(TypeSelector::Any, false).unwrap().0.len(), 64);
    mq.remove().unwrap();
}

#[test]
fn unallocatable_receive_buffer_is_an_error() {
    let mut mq = fresh();
    mq.set_max_message_size(QUEUE_MESSAGE_SIZE_MAX).unwrap();
    assert!(mq.set_max_message_size(QUEUE_MESSAGE_SIZE_MAX + 1).is_err());

    let err = mq.receive(TypeSelector::Any, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));

    mq.set_max_message_size(16).unwrap();
    mq.send(b"still usable", 1, false).unwrap();
    assert_eq!(mq.receive(TypeSelector::Any, false).unwrap().0, b"still usable");
    mq.remove().unwrap();
}

#[test]
fn full_queue_non_blocking_send_is_busy() {
    let mq = fresh();
    mq.set_max_size(32).unwrap();
    mq.send(&[0u8; 32], 1, false).unwrap();

    let err = mq.send(&[0u8; 1], 1, false).unwrap_err();
    assert!(err.is_busy());
    mq.remove().unwrap();
}

#[test]
fn blocked_receive_woken_by_send() {
    let mq = Arc::new(fresh());

    let rx = Arc::clone(&mq);
    let receiver = thread::spawn(move || rx.receive(TypeSelector::Exact(9), true));

    thread::sleep(Duration::from_millis(30));
    mq.send(b"wake", 9, true).unwrap();
    assert_eq!(receiver.join().unwrap().unwrap(), (b"wake".to_vec(), 9));
    mq.remove().unwrap();
}

#[test]
fn removal_wakes_blocked_receive() {
    let mq = Arc::new(fresh());
    let id = mq.id();

    let rx = Arc::clone(&mq);
    let receiver = thread::spawn(move || rx.receive(TypeSelector::Any, true));

    thread::sleep(Duration::from_millis(50));
    sysv_ipc::remove_message_queue(id).unwrap();
    let err = receiver.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Existential);
}

// ========== Control block ==========

#[test]
fn control_block_tracks_traffic() {
    let mq = fresh();
    assert!(mq.last_send_time().unwrap().is_none());
    assert!(mq.last_change_time().unwrap().is_some());

    mq.send(b"ping", 1, true).unwrap();
    let pid = std::process::id() as i32;
    assert_eq!(mq.last_send_pid().unwrap(), pid);
    assert!(mq.last_send_time().unwrap().is_some());

    mq.receive(TypeSelector::Any, true).unwrap();
    assert_eq!(mq.last_receive_pid().unwrap(), pid);
    assert!(mq.last_receive_time().unwrap().is_some());
    mq.remove().unwrap();
}

#[test]
fn field_table_access() {
    let mut mq = fresh();
    assert_eq!(mq.get_field("max_message_size").unwrap(), FieldValue::Int(2048));
    assert_eq!(mq.get_field("current_messages").unwrap(), FieldValue::Int(0));

    mq.set_field("max_message_size", FieldValue::Int(100)).unwrap();
    assert_eq!(mq.max_message_size(), 100);
    mq.set_field("mode", FieldValue::Int(0o660)).unwrap();
    assert_eq!(mq.mode().unwrap(), 0o660);

    let err = mq
        .set_field("last_send_pid", FieldValue::Int(1))
        .unwrap_err();
    assert!(matches!(
        err,
        IpcError::Usage(UsageError::ReadOnlyField("last_send_pid"))
    ));
    let err = mq.set_field("nonsense", FieldValue::Int(1)).unwrap_err();
    assert!(matches!(err, IpcError::Usage(UsageError::UnknownField(_))));
    mq.remove().unwrap();
}

#[test]
fn removed_handle_fails_fast() {
    let mq = fresh();
    mq.remove().unwrap();
    let err = mq.send(b"x", 1, false).unwrap_err();
    assert!(matches!(
        err,
        IpcError::Existential {
            cause: Existence::Removed,
            ..
        }
    ));
}
