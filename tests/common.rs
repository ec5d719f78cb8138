//! Test utilities: an in-process fake dispenser served by axum.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A fake device listening on 127.0.0.1. `received` collects every dispense `amount`.
pub struct FakeDevice {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<String>>>,
}

impl FakeDevice {
    /// Network address in the `host:port` form the transport uses verbatim.
    pub fn network_address(&self) -> String {
        self.addr.to_string()
    }

    pub fn amounts(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Device that identifies as `hardware_address` and answers dispenses with `dispense_status`.
pub async fn spawn_device(hardware_address: &str, dispense_status: StatusCode) -> FakeDevice {
    let received = Arc::new(Mutex::new(Vec::new()));
    let hw = hardware_address.to_string();
    let log = received.clone();
    let app = Router::new()
        .route(
            "/",
            get(move || {
                let hw = hw.clone();
                async move { Json(json!({ "hardwareAddress": hw, "status": "ready" })) }
            }),
        )
        .route(
            "/dispense",
            post(move |Json(body): Json<Value>| {
                let log = log.clone();
                async move {
                    let amount = body["amount"].as_str().unwrap_or_default().to_string();
                    log.lock().unwrap().push(amount);
                    dispense_status
                }
            }),
        );
    let addr = serve(app).await;
    FakeDevice { addr, received }
}

/// Device whose identity endpoint answers only after `delay`.
#[allow(dead_code)]
pub async fn spawn_slow_device(delay: Duration) -> SocketAddr {
    let app = Router::new().route(
        "/",
        get(move || async move {
            tokio::time::sleep(delay).await;
            Json(json!({ "hardwareAddress": "00:00:00:00:00:01" }))
        }),
    );
    serve(app).await
}

/// Device whose identity endpoint returns something that is not JSON.
#[allow(dead_code)]
pub async fn spawn_garbled_device() -> SocketAddr {
    serve(Router::new().route("/", get(|| async { "hello from a printer" }))).await
}

/// An address with nothing listening on it.
#[allow(dead_code)]
pub async fn closed_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
