//! Integration tests for the push ingress endpoint.

#![cfg(feature = "web")]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use rs_megad::hal::MockTransport;
use rs_megad::services::build_router;
use rs_megad::{Config, DeviceConfig, DeviceHandle, DeviceLayout, PortId, PortValue};

fn create_test_app() -> (axum::Router, Arc<DeviceHandle<MockTransport>>) {
    let config = Config::new(DeviceConfig::new("10.0.0.14", "sec").with_events_delay_ms(0));
    let device = Arc::new(DeviceHandle::new(MockTransport::new(), config));
    device.set_layout(DeviceLayout {
        extenders: BTreeSet::from([30]),
        interrupts: BTreeMap::from([(5, 30)]),
        ..Default::default()
    });
    let router = build_router(Arc::clone(&device));
    (router, device)
}

async fn push(app: axum::Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_input_press_and_release() {
    let (app, device) = create_test_app();

    let (status, content_type, body) = push(app.clone(), "/mega?pt=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/plain"));
    assert_eq!(body, "d");
    assert_eq!(device.store().get(&PortId::Simple(3)), Some(PortValue::OnOff(true)));

    push(app, "/mega?pt=3&m=1").await;
    assert_eq!(device.store().get(&PortId::Simple(3)), Some(PortValue::OnOff(false)));
    assert!(device.store().last_push().is_some());
}

#[tokio::test]
async fn test_value_push() {
    let (app, device) = create_test_app();

    push(app.clone(), "/mega?pt=8&v=21.5").await;
    assert_eq!(device.store().get(&PortId::Simple(8)), Some(PortValue::Numeric(21.5)));

    push(app, "/mega?pt=9&v=busy").await;
    assert_eq!(device.store().get(&PortId::Simple(9)), None);
}

#[tokio::test]
async fn test_extender_push_is_redirected() {
    let (app, device) = create_test_app();

    push(app, "/mega?pt=5&ext=2&m=1").await;
    assert_eq!(
        device.store().get(&PortId::extender_child(30, 2)),
        Some(PortValue::OnOff(false))
    );
    assert_eq!(device.store().get(&PortId::Simple(5)), None);
}

#[tokio::test]
async fn test_missing_port_is_rejected() {
    let (app, device) = create_test_app();

    let (status, _, _) = push(app.clone(), "/mega?m=1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = push(app, "/mega?pt=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(device.store().is_empty());
}

#[tokio::test]
async fn test_callbacks_run_once_events_are_enabled() {
    let (app, device) = create_test_app();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    device.subscribe(PortId::Simple(3), move |_, value| {
        assert_eq!(value, &PortValue::OnOff(true));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    push(app.clone(), "/mega?pt=3").await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    device.start();
    while !device.events_enabled() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    push(app, "/mega?pt=3").await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    device.stop();
}

#[tokio::test]
async fn test_unknown_route() {
    let (app, _device) = create_test_app();
    let (status, _, _) = push(app, "/api/state").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
