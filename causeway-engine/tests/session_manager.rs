//! Session manager integration tests against a scripted access authority

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use causeway_core::{AccessUsage, SessionErrorCode, SessionResponse};
use causeway_engine::socket::SystemSocketFactory;
use causeway_engine::{EngineConfig, Error, SessionManager};

use common::*;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.udp.worker_max_count = 4;
    config
}

struct Fixture {
    access: Arc<MockAccessAuthority>,
    tracker: Arc<CaptureTracker>,
    manager: Arc<SessionManager>,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let access = Arc::new(MockAccessAuthority::new());
    let tracker = Arc::new(CaptureTracker::new());
    let manager = SessionManager::new(
        access.clone(),
        Arc::new(SystemSocketFactory),
        Arc::new(CaptureSink::new()),
        config,
    )
    .unwrap()
    .with_tracker(tracker.clone());
    Fixture {
        access,
        tracker,
        manager: Arc::new(manager),
    }
}

fn fixture() -> Fixture {
    fixture_with(test_config())
}

#[tokio::test]
async fn test_happy_create() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));

    let response = f
        .manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    assert_eq!(response.session_id.value(), 42);
    assert!(response.response.error_code.is_ok());
    assert!(f.manager.find_session(response.session_id).await.is_some());
    assert_eq!(f.manager.session_count().await, 1);

    // page_view is fired from a detached task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.tracker.count_of("page_view"), 1);
    let events = f.tracker.events();
    let page_view = events.iter().find(|e| e.name == "page_view").unwrap();
    assert!(page_view
        .properties
        .iter()
        .any(|(k, v)| k == "client_version" && v == "1.2.3"));
}

#[tokio::test]
async fn test_access_denied_is_generic() {
    let f = fixture();
    f.access.set_create_reply(MockReply::Response(error_response(
        42,
        SessionErrorCode::AccessError,
        "banned",
    )));

    let err = f
        .manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap_err();

    // The authority's detail must not reach the client
    match err {
        Error::Unauthorized { message } => {
            assert_eq!(message, "Access Error.");
            assert!(!message.contains("banned"));
        }
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert_eq!(f.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_create_failure_carries_authority_response() {
    let f = fixture();
    f.access.set_create_reply(MockReply::Response(error_response(
        42,
        SessionErrorCode::Maintenance,
        "down for maintenance",
    )));

    let err = f
        .manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap_err();
    assert_eq!(err.session_error_code(), Some(SessionErrorCode::Maintenance));
}

#[tokio::test]
async fn test_create_then_get_returns_same_session() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    let first = f
        .manager
        .get_session(&session_request(42, TEST_KEY), endpoints())
        .await
        .unwrap();
    let second = f
        .manager
        .get_session(&session_request(42, TEST_KEY), endpoints())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    // No recovery happened
    assert_eq!(f.access.get_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_get_with_wrong_key_is_unauthorized() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    let wrong_key = causeway_core::SessionKey::new([0xFF; 16]);
    let err = f
        .manager
        .get_session(&session_request(42, wrong_key), endpoints())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));

    // The session map is untouched and the right key still works
    assert_eq!(f.manager.session_count().await, 1);
    assert!(f
        .manager
        .get_session(&session_request(42, TEST_KEY), endpoints())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_recovery_coalesces_concurrent_requests() {
    let f = fixture();
    f.access
        .set_get_reply(MockReply::Response(ok_response(7, TEST_KEY)));
    f.access.set_get_delay(Duration::from_millis(50));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let manager = f.manager.clone();
            tokio::spawn(async move {
                manager
                    .get_session(&session_request(7, TEST_KEY), endpoints())
                    .await
            })
        })
        .collect();

    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap().unwrap());
    }

    // Exactly one authority call, all callers share the one session
    assert_eq!(f.access.get_calls.load(Ordering::SeqCst), 1);
    for session in &sessions[1..] {
        assert!(Arc::ptr_eq(&sessions[0], session));
    }
}

#[tokio::test]
async fn test_recovery_with_wrong_key_is_unauthorized() {
    let f = fixture();
    f.access
        .set_get_reply(MockReply::Response(ok_response(7, TEST_KEY)));

    let wrong_key = causeway_core::SessionKey::new([0xEE; 16]);
    let err = f
        .manager
        .get_session(&session_request(7, wrong_key), endpoints())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
}

#[tokio::test]
async fn test_dead_session_caches_recovery_failure() {
    let f = fixture();
    f.access
        .set_get_reply(MockReply::Failure("authority down".into()));

    let err = f
        .manager
        .get_session(&session_request(9, TEST_KEY), endpoints())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Access(_)));
    assert_eq!(f.access.get_calls.load(Ordering::SeqCst), 1);

    // The retry is answered from the cached dead session, without another
    // authority round trip
    let err = f
        .manager
        .get_session(&session_request(9, TEST_KEY), endpoints())
        .await
        .unwrap_err();
    assert_eq!(err.session_error_code(), Some(SessionErrorCode::SessionError));
    assert_eq!(f.access.get_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_session_is_idempotent() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    let response = f
        .manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    f.manager.close_session(response.session_id).await;
    f.manager.close_session(response.session_id).await;

    // One closing usage report despite two calls
    assert_eq!(f.access.closing_reports(), 1);

    // The closed session is still present but reports closed
    let err = f
        .manager
        .get_session(&session_request(42, TEST_KEY), endpoints())
        .await
        .unwrap_err();
    assert_eq!(
        err.session_error_code(),
        Some(SessionErrorCode::SessionClosed)
    );

    // Closing an unknown session is not an error
    f.manager
        .close_session(causeway_core::SessionId::new(4040))
        .await;
}

#[tokio::test]
async fn test_sync_sessions_reports_usage() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    f.manager.sync_sessions().await;
    let reports = f.access.usage_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0.value(), 42);
    assert!(!reports[0].2);
}

#[tokio::test]
async fn test_cleanup_removes_timed_out_sessions() {
    let mut config = test_config();
    config.session.session_timeout_secs = 1;
    let f = fixture_with(config);

    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();
    assert_eq!(f.manager.session_count().await, 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    f.manager.run_job().await;
    assert_eq!(f.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_cleanup_retires_expired_access() {
    let f = fixture();

    let mut response = ok_response(42, TEST_KEY);
    response.response.access_usage = Some(AccessUsage {
        expiration_time: Some(SystemTime::now() - Duration::from_secs(1)),
        ..Default::default()
    });
    f.access.set_create_reply(MockReply::Response(response));
    f.access.set_usage_reply(SessionResponse::error(
        SessionErrorCode::SessionClosed,
        "access expired",
    ));

    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    f.manager.run_job().await;
    // The expired session was synced, retired by the authority reply, and
    // swept out of the map
    assert!(f.access.usage_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(f.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_heartbeat_fires_at_most_once_per_interval() {
    let f = fixture();
    f.manager.run_job().await;
    f.manager.run_job().await;
    f.manager.run_job().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.tracker.count_of("heartbeat"), 1);

    let events = f.tracker.events();
    let heartbeat = events.iter().find(|e| e.name == "heartbeat").unwrap();
    assert!(heartbeat
        .properties
        .iter()
        .any(|(k, v)| k == "session_count" && v == "0"));
}

#[tokio::test]
async fn test_dispose_joins_in_flight_disposal() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    let first = {
        let manager = f.manager.clone();
        tokio::spawn(async move { manager.dispose().await })
    };
    let second = {
        let manager = f.manager.clone();
        tokio::spawn(async move { manager.dispose().await })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert!(f.manager.is_disposed());
    assert_eq!(f.manager.session_count().await, 0);

    // A disposed manager refuses new work
    let err = f
        .manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disposed));
}

#[tokio::test]
async fn test_shared_pool_mode() {
    let mut config = test_config();
    config.udp.shared_pool = true;
    let f = fixture_with(config);

    f.access
        .set_create_reply(MockReply::Response(ok_response(1, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();
    f.access
        .set_create_reply(MockReply::Response(ok_response(2, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    let a = f
        .manager
        .find_session(causeway_core::SessionId::new(1))
        .await
        .unwrap();
    let b = f
        .manager
        .find_session(causeway_core::SessionId::new(2))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(a.udp_pool(), b.udp_pool()));
}

#[tokio::test]
async fn test_duplicate_session_id_is_rejected() {
    let f = fixture();
    f.access
        .set_create_reply(MockReply::Response(ok_response(42, TEST_KEY)));
    f.manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap();

    // The authority hands out the same id again
    let err = f
        .manager
        .create_session(&hello_request(), endpoints())
        .await
        .unwrap_err();
    assert_eq!(err.session_error_code(), Some(SessionErrorCode::SessionError));
    // The original session is untouched
    assert_eq!(f.manager.session_count().await, 1);
    assert!(f
        .manager
        .get_session(&session_request(42, TEST_KEY), endpoints())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_server_secret_rotation_changes_api_key() {
    let f = fixture();
    let initial_key = f.manager.api_key();

    f.manager.set_server_secret(vec![0x55; 128]);
    let rotated_key = f.manager.api_key();
    assert_ne!(initial_key, rotated_key);
    assert_eq!(
        rotated_key,
        causeway_core::derive_api_key(&f.manager.server_secret())
    );

    // Same secret, same key
    f.manager.set_server_secret(vec![0x55; 128]);
    assert_eq!(f.manager.api_key(), rotated_key);
}
