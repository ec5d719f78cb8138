mod common;

use axum::http::StatusCode;
use std::time::Duration;
use syrupnet::device::{DeviceTransport, FailureReason, HttpTransport, TransportError};

fn transport() -> HttpTransport {
    HttpTransport::new(80, Duration::from_millis(500), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn probe_reports_identity() {
    let device = common::spawn_device("aa:bb:cc:dd:ee:ff", StatusCode::OK).await;
    let report = transport().probe(&device.network_address()).await.unwrap();
    assert_eq!(report.normalized_address().as_deref(), Some("AABBCCDDEEFF"));
    assert_eq!(report.status(), "ready");
    assert!(report.is_acceptable());
}

#[tokio::test]
async fn dispense_sends_tv_payload() {
    let device = common::spawn_device("AABBCCDDEEFF", StatusCode::OK).await;
    tokio_test::assert_ok!(transport().dispense(&device.network_address(), 50).await);
    assert_eq!(device.amounts(), vec!["TV50 FF FF FF".to_string()]);
}

#[tokio::test]
async fn non_200_is_rejected() {
    let device = common::spawn_device("AABBCCDDEEFF", StatusCode::SERVICE_UNAVAILABLE).await;
    let err = transport()
        .dispense(&device.network_address(), 5)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Status(503));
    assert_eq!(err.reason(), FailureReason::Rejected);
}

#[tokio::test]
async fn accepted_but_not_ok_is_still_a_failure() {
    let device = common::spawn_device("AABBCCDDEEFF", StatusCode::ACCEPTED).await;
    let err = transport()
        .dispense(&device.network_address(), 5)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Status(202));
}

#[tokio::test]
async fn closed_port_is_refused() {
    let addr = common::closed_address().await;
    let err = transport().probe(&addr).await.unwrap_err();
    assert!(
        matches!(err, TransportError::Refused | TransportError::Unreachable),
        "unexpected {:?}",
        err
    );
}

#[tokio::test]
async fn stalled_device_times_out() {
    let addr = common::spawn_slow_device(Duration::from_secs(3)).await;
    let err = transport().probe(&addr.to_string()).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.reason(), FailureReason::Timeout);
}

#[tokio::test]
async fn garbled_identity_is_malformed() {
    let addr = common::spawn_garbled_device().await;
    let err = transport().probe(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, TransportError::Malformed(_)));
}
