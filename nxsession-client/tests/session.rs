mod common;

use common::*;
use nxsession_client::notification as notify;
use nxsession_client::{
    ConnectionState, Credentials, NotificationPayload, Session, SessionError, TimeoutCategory,
};
use nxsession_protocol::codes::*;
use nxsession_protocol::{Frame, FrameFlags, ResultCode};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_requests_answered_out_of_order() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.server_info().server_version, "mock-5.0");
    assert_eq!(session.login_info().unwrap().session_id, 42);

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request_completion(Frame::new(CMD_GET_OBJECTS).with_field(VID_OBJECT_ID, 1u32))
                .await
        })
    };
    let a = peer.expect(CMD_GET_OBJECTS).await;
    let second = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request_completion(Frame::new(CMD_GET_OBJECTS).with_field(VID_OBJECT_ID, 2u32))
                .await
        })
    };
    let b = peer.expect(CMD_GET_OBJECTS).await;
    assert_ne!(a.id, b.id);

    // Answer the later request first.
    peer.send(&completion(b.id).with_field(VID_OBJECT_NAME, "second")).await;
    peer.send(&completion(a.id).with_field(VID_OBJECT_NAME, "first")).await;

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.id, a.id);
    assert_eq!(first.get_str(VID_OBJECT_NAME).as_deref(), Some("first"));
    assert_eq!(second.id, b.id);
    assert_eq!(second.get_str(VID_OBJECT_NAME).as_deref(), Some("second"));

    session.disconnect().await;
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let mut ids = HashSet::new();
    for _ in 0..50 {
        let id = session.send(Frame::new(CMD_KEEPALIVE)).await.unwrap();
        assert!(ids.insert(id), "id {} reused", id);
    }
    for _ in 0..50 {
        let frame = peer.expect(CMD_KEEPALIVE).await;
        assert!(ids.contains(&frame.id));
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_encrypted_session() {
    let server = MockServer::bind().await;
    let config = server.config().with_encryption(true);
    let hs = Handshake {
        encryption: true,
        ..Default::default()
    };
    let (session, mut peer) = connect(&server, config, hs).await;
    assert!(session.is_encrypted().await);

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    peer.send(&completion(request.id).with_field(VID_OBJECT_NAME, "sealed")).await;
    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.get_str(VID_OBJECT_NAME).as_deref(), Some("sealed"));

    session.disconnect().await;
}

#[tokio::test]
async fn test_failure_code_becomes_request_error() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    let mut reply = failure(request.id, ResultCode::AccessDenied)
        .with_field(VID_ERROR_TEXT, "not allowed");
    reply.set_u32_list(VID_OBJECT_LIST, &[4, 5]);
    peer.send(&reply).await;

    match call.await.unwrap() {
        Err(SessionError::Request {
            code,
            message,
            related_ids,
        }) => {
            assert_eq!(code, ResultCode::AccessDenied);
            assert_eq!(message.as_deref(), Some("not allowed"));
            assert_eq!(related_ids, vec![4, 5]);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_request_times_out() {
    let server = MockServer::bind().await;
    let config = server.config().with_command_timeout(Duration::from_millis(100));
    let (session, mut peer) = connect(&server, config, Handshake::default()).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    peer.expect(CMD_GET_OBJECTS).await;
    assert!(matches!(call.await.unwrap(), Err(SessionError::Timeout)));
    assert!(session.is_connected());

    session.disconnect().await;
}

#[tokio::test]
async fn test_connection_loss_releases_waiters() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    let mut calls = Vec::new();
    for _ in 0..3 {
        let session = session.clone();
        calls.push(tokio::spawn(async move {
            session.request_completion(Frame::new(CMD_GET_OBJECTS)).await
        }));
    }
    for _ in 0..3 {
        peer.expect(CMD_GET_OBJECTS).await;
    }
    drop(peer);

    for call in calls {
        let result = tokio::time::timeout(STEP_TIMEOUT, call).await.unwrap().unwrap();
        assert!(
            matches!(result, Err(SessionError::ConnectionBroken(_))),
            "unexpected result: {:?}",
            result
        );
    }
    recorder.wait_for(notify::CONNECTION_BROKEN, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(notify::CONNECTION_BROKEN), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // Later calls fail fast.
    let later = session.request_completion(Frame::new(CMD_GET_OBJECTS)).await;
    assert!(later.is_err());
}

#[tokio::test]
async fn test_disconnect_is_silent() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .wait_for_message(CMD_REQUEST_COMPLETED, 9999, Duration::from_secs(5))
                .await
        })
    };
    tokio::task::yield_now().await;

    session.disconnect().await;
    session.disconnect().await;
    peer.drain_until_closed().await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(SessionError::SessionClosed)
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(recorder.count(notify::CONNECTION_BROKEN), 0);
}

#[tokio::test]
async fn test_session_killed_by_peer() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    peer.send(&Frame::new(CMD_NOTIFY).with_field(VID_NOTIFICATION_CODE, notify::SESSION_KILLED))
        .await;

    recorder.wait_for(notify::CONNECTION_BROKEN, 1).await;
    let codes = recorder.codes();
    assert_eq!(
        codes,
        vec![notify::SESSION_KILLED, notify::CONNECTION_BROKEN]
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_push_updates_reach_cache_before_listeners() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let seen_in_cache = Arc::new(AtomicUsize::new(0));
    {
        let session = session.clone();
        let seen_in_cache = seen_in_cache.clone();
        session.clone().add_listener(Arc::new(move |n: &nxsession_client::Notification| {
            if n.code == notify::OBJECT_CHANGED && session.objects().contains(n.subcode as u32) {
                seen_in_cache.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    peer.send(
        &Frame::new(CMD_OBJECT_UPDATE)
            .with_field(VID_OBJECT_ID, 10u32)
            .with_field(VID_OBJECT_CLASS, nxsession_client::cache::CLASS_NODE)
            .with_field(VID_OBJECT_NAME, "router-1")
            .with_field(VID_IP_ADDRESS, "10.0.0.1"),
    )
    .await;
    recorder.wait_for(notify::OBJECT_CHANGED, 1).await;
    assert_eq!(seen_in_cache.load(Ordering::SeqCst), 1);

    let cached = session.objects().get(10).unwrap();
    assert_eq!(cached.name, "router-1");
    assert_eq!(
        cached.class,
        nxsession_client::EntityClass::Node {
            primary_ip: Some("10.0.0.1".into())
        }
    );

    peer.send(
        &Frame::new(CMD_OBJECT_UPDATE)
            .with_field(VID_OBJECT_ID, 10u32)
            .with_field(VID_IS_DELETED, true),
    )
    .await;
    recorder.wait_for(notify::OBJECT_DELETED, 1).await;
    assert!(session.objects().get(10).is_none());

    session.disconnect().await;
}

#[tokio::test]
async fn test_generic_and_custom_notifications() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    peer.send(
        &Frame::new(CMD_NOTIFY)
            .with_field(VID_NOTIFICATION_CODE, 3u32)
            .with_field(VID_NOTIFICATION_DATA, "maintenance"),
    )
    .await;
    peer.send(&Frame::with_id(0x1001, 5).with_field(VID_OBJECT_NAME, "custom")).await;

    recorder.wait_for(notify::CUSTOM_MESSAGE, 1).await;
    let all = recorder.all();
    assert_eq!(all[0].code, notify::NOTIFY_BASE + 3);
    assert!(matches!(&all[0].payload, NotificationPayload::Text(t) if t == "maintenance"));
    assert_eq!(all[1].subcode, 0x1001);
    match &all[1].payload {
        NotificationPayload::Message(frame) => assert_eq!(frame.id, 5),
        other => panic!("unexpected payload: {:?}", other),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_keepalive_sets_server_time() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    peer.send(&Frame::new(CMD_KEEPALIVE).with_field(VID_TIMESTAMP, 1_800_000_000u64))
        .await;
    tokio::time::timeout(STEP_TIMEOUT, async {
        while session.server_time().map(|t| t.timestamp()) < Some(1_800_000_000) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    session.disconnect().await;
}

#[tokio::test]
async fn test_message_subscription_until_handler_completes() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let lines = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handle = {
        let lines = lines.clone();
        session.subscribe_messages(
            CMD_EXECUTE_SCRIPT_UPDATE,
            77,
            Arc::new(move |frame: &Frame| {
                if let Some(text) = frame.get_str(VID_MESSAGE) {
                    lines.lock().push(text);
                }
                frame.is_end_of_sequence()
            }),
            Duration::from_secs(5),
        )
    };

    for (i, text) in ["one", "two", "three"].iter().enumerate() {
        let mut frame = Frame::with_id(CMD_EXECUTE_SCRIPT_UPDATE, 77).with_field(VID_MESSAGE, *text);
        frame.flags.set(FrameFlags::END_OF_SEQUENCE, i == 2);
        peer.send(&frame).await;
    }

    tokio::time::timeout(STEP_TIMEOUT, handle.completed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*lines.lock(), vec!["one", "two", "three"]);

    session.disconnect().await;
}

#[tokio::test]
async fn test_receive_sequence_and_stop() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let collector = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .receive_sequence(CMD_EXECUTE_SCRIPT_UPDATE, 31, Duration::from_secs(5))
                .await
        })
    };
    for last in [false, false, true] {
        let mut frame = Frame::with_id(CMD_EXECUTE_SCRIPT_UPDATE, 31);
        frame.flags.set(FrameFlags::END_OF_SEQUENCE, last);
        peer.send(&frame).await;
    }
    assert_eq!(collector.await.unwrap().unwrap().len(), 3);

    session.stop_operation(CMD_STOP_SCRIPT, 31).await.unwrap();
    let stop = peer.expect(CMD_STOP_SCRIPT).await;
    assert_eq!(stop.get_u32(VID_REQUEST_ID), Some(31));

    session.disconnect().await;
}

#[tokio::test]
async fn test_cache_misses_are_batched() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    session.request_object_sync(7);
    session.request_object_sync(5);
    session.request_object_sync(7);

    let request = peer.expect(CMD_GET_SELECTED_OBJECTS).await;
    assert_eq!(request.get_u32(VID_NUM_OBJECTS), Some(2));
    assert_eq!(request.get_u32_list(VID_OBJECT_LIST), Some(vec![5, 7]));
    peer.complete(request.id).await;

    session.disconnect().await;
}

#[tokio::test]
async fn test_topic_reference_counting() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let subscriber = {
        let session = session.clone();
        tokio::spawn(async move { session.subscribe("alarms").await })
    };
    let change = peer.expect(CMD_CHANGE_SUBSCRIPTION).await;
    assert_eq!(change.get_str(VID_TOPIC).as_deref(), Some("alarms"));
    assert!(change.get_bool(VID_OPERATION));
    peer.complete(change.id).await;
    assert_eq!(subscriber.await.unwrap().unwrap(), 1);

    // A second reference is local only.
    assert_eq!(session.subscribe("alarms").await.unwrap(), 2);
    assert_eq!(session.unsubscribe("alarms").await.unwrap(), 1);

    let unsubscriber = {
        let session = session.clone();
        tokio::spawn(async move { session.unsubscribe("alarms").await })
    };
    let change = peer.expect(CMD_CHANGE_SUBSCRIPTION).await;
    assert!(!change.get_bool(VID_OPERATION));
    peer.complete(change.id).await;
    assert_eq!(unsubscriber.await.unwrap().unwrap(), 0);
    assert_eq!(session.topic_count("alarms").await, 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_protocol_version_mismatch_rejected() {
    let server = MockServer::bind().await;
    let client = tokio::spawn(Session::connect(
        server.config(),
        Credentials::password("admin", "secret"),
    ));
    let mut peer = server.accept().await;
    let info = peer.expect(CMD_GET_SERVER_INFO).await;
    peer.send(&completion(info.id).with_field(VID_PROTOCOL_VERSION, 1u32)).await;

    match client.await.unwrap() {
        Err(SessionError::Request { code, .. }) => assert_eq!(code, ResultCode::BadProtocol),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    peer.drain_until_closed().await;
}

#[tokio::test]
async fn test_bulk_category_uses_longer_timeout() {
    let server = MockServer::bind().await;
    let config = server.config().with_command_timeout(Duration::from_millis(50));
    let (session, mut peer) = connect(&server, config, Handshake::default()).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request_completion_with(Frame::new(CMD_GET_OBJECTS), TimeoutCategory::Bulk)
                .await
        })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    peer.complete(request.id).await;
    assert!(call.await.unwrap().is_ok());

    session.disconnect().await;
}

#[tokio::test]
async fn test_bad_frame_streak_below_limit_is_tolerated() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    let junk = Frame::new(CMD_KEEPALIVE).with_field(VID_TIMESTAMP, 1u64);
    peer.send_corrupted(&junk, nxsession_client::MAX_CONSECUTIVE_ERRORS as usize)
        .await;
    peer.complete(request.id).await;
    assert!(call.await.unwrap().is_ok());

    // The good frame reset the streak, so another full streak is fine too.
    peer.send_corrupted(&junk, nxsession_client::MAX_CONSECUTIVE_ERRORS as usize)
        .await;
    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    peer.complete(request.id).await;
    assert!(call.await.unwrap().is_ok());

    assert!(session.is_connected());
    assert_eq!(recorder.count(notify::CONNECTION_BROKEN), 0);
    session.disconnect().await;
}

#[tokio::test]
async fn test_bad_frame_streak_over_limit_breaks_connection() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    peer.expect(CMD_GET_OBJECTS).await;
    let junk = Frame::new(CMD_KEEPALIVE).with_field(VID_TIMESTAMP, 1u64);
    peer.send_corrupted(&junk, nxsession_client::MAX_CONSECUTIVE_ERRORS as usize + 1)
        .await;

    let result = tokio::time::timeout(STEP_TIMEOUT, call).await.unwrap().unwrap();
    assert!(
        matches!(result, Err(SessionError::ConnectionBroken(_))),
        "unexpected result: {:?}",
        result
    );
    recorder.wait_for(notify::CONNECTION_BROKEN, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(notify::CONNECTION_BROKEN), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_out_of_range_notification_code_is_dropped() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    peer.send(&Frame::new(CMD_NOTIFY).with_field(VID_NOTIFICATION_CODE, u32::MAX))
        .await;
    peer.send(&Frame::new(CMD_NOTIFY).with_field(VID_NOTIFICATION_CODE, 4u32))
        .await;
    peer.complete(request.id).await;

    assert!(call.await.unwrap().is_ok());
    recorder.wait_for(notify::NOTIFY_BASE + 4, 1).await;
    assert_eq!(recorder.codes(), vec![notify::NOTIFY_BASE + 4]);
    assert!(session.is_connected());

    session.disconnect().await;
}

#[tokio::test]
async fn test_inflated_record_batch_does_not_stall_reader() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    peer.send(&Frame::new(CMD_SYSLOG_RECORDS).with_field(VID_NUM_RECORDS, 5_000_000u32))
        .await;
    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request_completion(Frame::new(CMD_GET_OBJECTS)).await })
    };
    let request = peer.expect(CMD_GET_OBJECTS).await;
    peer.complete(request.id).await;
    tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("reader stalled on the batch")
        .unwrap()
        .unwrap();
    assert!(recorder.count(notify::NEW_SYSLOG_RECORD) <= 1);
    assert_eq!(session.dropped_notifications(), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_user_database_load() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    let sync = {
        let session = session.clone();
        tokio::spawn(async move { session.sync_users().await })
    };
    let request = peer.expect(CMD_LOAD_USER_DB).await;
    peer.complete(request.id).await;
    peer.send(
        &Frame::new(CMD_USER_DATA)
            .with_field(VID_USER_ID, 1u32)
            .with_field(VID_NAME, "admin"),
    )
    .await;
    peer.send(
        &Frame::new(CMD_USER_DATA)
            .with_field(VID_USER_ID, 7u32)
            .with_field(VID_NAME, "old"),
    )
    .await;
    peer.send(
        &Frame::new(CMD_GROUP_DATA)
            .with_field(VID_USER_ID, nxsession_client::cache::GROUP_FLAG | 1)
            .with_field(VID_NAME, "Everyone"),
    )
    .await;
    peer.send(
        &Frame::new(CMD_USER_DATA)
            .with_field(VID_USER_ID, 7u32)
            .with_field(VID_IS_DELETED, true),
    )
    .await;
    peer.send(&Frame::new(CMD_USER_DB_EOF)).await;

    tokio::time::timeout(STEP_TIMEOUT, sync).await.unwrap().unwrap().unwrap();
    let users = session.users();
    assert_eq!(users.get(1).unwrap().name, "admin");
    assert!(users.get(7).is_none());
    let group = users.get(nxsession_client::cache::GROUP_FLAG | 1).unwrap();
    assert_eq!(group.class, nxsession_client::EntityClass::User { is_group: true });

    recorder.wait_for(notify::USER_DB_SYNC_COMPLETED, 1).await;
    assert_eq!(recorder.count(notify::USER_DB_CHANGED), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_job_console_and_unshifted_notifications() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;
    let recorder = Recorder::new();
    session.add_listener(recorder.clone());

    peer.send(&Frame::new(CMD_JOB_CHANGE_NOTIFICATION).with_field(VID_JOB_ID, 55u64))
        .await;
    peer.send(&Frame::new(CMD_ADM_MESSAGE).with_field(VID_MESSAGE, "debug level set\n"))
        .await;
    peer.send(
        &Frame::new(CMD_RS_NOTIFY)
            .with_field(VID_NOTIFICATION_CODE, 2042u32)
            .with_field(VID_NOTIFICATION_DATA, 9u64),
    )
    .await;

    recorder.wait_for(2042, 1).await;
    let all = recorder.all();
    assert_eq!(
        all.iter().map(|n| n.code).collect::<Vec<_>>(),
        vec![notify::JOB_CHANGED, notify::CONSOLE_OUTPUT, 2042]
    );
    assert_eq!(all[0].subcode, 55);
    assert!(matches!(&all[1].payload, NotificationPayload::Text(t) if t == "debug level set\n"));
    assert_eq!(all[2].subcode, 9);

    session.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_broken_survives_full_queue() {
    let server = MockServer::bind().await;
    let config = server.config().with_notification_queue_size(2);
    let (session, mut peer) = connect(&server, config, Handshake::default()).await;

    // Hold the consumer inside the first delivery until released.
    let gate = Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));
    let recorder = Recorder::new();
    {
        let gate = gate.clone();
        let recorder = recorder.clone();
        session.add_listener(Arc::new(move |n: &nxsession_client::Notification| {
            tokio::task::block_in_place(|| {
                let (open, cv) = &*gate;
                let mut open = open.lock();
                while !*open {
                    cv.wait(&mut open);
                }
            });
            nxsession_client::SessionListener::on_notification(&*recorder, n);
        }));
    }

    for code in 1..=6u32 {
        peer.send(&Frame::new(CMD_NOTIFY).with_field(VID_NOTIFICATION_CODE, code))
            .await;
    }
    tokio::time::timeout(STEP_TIMEOUT, async {
        while session.dropped_notifications() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    drop(peer);
    tokio::time::timeout(STEP_TIMEOUT, async {
        while session.state() != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    {
        let (open, cv) = &*gate;
        *open.lock() = true;
        cv.notify_all();
    }
    recorder.wait_for(notify::CONNECTION_BROKEN, 1).await;
    assert_eq!(recorder.count(notify::CONNECTION_BROKEN), 1);
    assert_eq!(
        recorder.codes().last().copied(),
        Some(notify::CONNECTION_BROKEN)
    );
}
