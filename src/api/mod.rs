//! # REST API
//!
//! Read-only views of the registry and the loaded services, plus actuation
//! proxied to the actuator clients.
//!
//! | Route                    | Method | Answer                              |
//! |--------------------------|--------|-------------------------------------|
//! | `/api/device`            | GET    | `{ "devices": [addr, ..] }`         |
//! | `/api/device/{addr}`     | GET    | `{ ip, mac, service, type }`        |
//! | `/api/sensor/{addr}`     | GET    | `{ "payload": reading }`            |
//! | `/api/actuator/{addr}`   | GET    | `{ "payload": state }`              |
//! | `/api/actuator/{addr}`   | PUT    | echo of `{ "payload": state }`      |
//! | `/api/service`           | GET    | `[ { name, serviceName, .. }, .. ]` |
//!
//! Unknown addresses (or a device of the wrong kind) answer 404, malformed bodies
//! 400 and encoding failures 500.

pub mod error;
pub mod handlers;

pub use error::ApiError;

use crate::device::DeviceRegistry;
use crate::service::ServiceMap;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ApiState {
    pub registry: Arc<DeviceRegistry>,
    pub services: Arc<ServiceMap>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/device", get(handlers::list_devices))
        .route("/api/device/{addr}", get(handlers::get_device))
        .route("/api/sensor/{addr}", get(handlers::get_sensor))
        .route(
            "/api/actuator/{addr}",
            get(handlers::get_actuator).put(handlers::put_actuator),
        )
        .route("/api/service", get(handlers::list_services))
        .with_state(state)
}

/// Running API server
#[derive(Debug)]
pub struct ApiHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ApiHandle {
    /// Serves the API on `listener` until [`ApiHandle::stop`]
    pub fn spawn(listener: TcpListener, state: ApiState) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = router(state);

        info!("Starting the API server on {}", local_addr);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("API server failed: {}", e);
            }
        });

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests
    pub async fn stop(self) {
        info!("Stopping the API server");
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("API server task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{serve, MockNode};
    use crate::device::{ClientSettings, DeviceClient};
    use crate::service::plugin::tests::Recorder;
    use crate::service::ServiceHandle;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    struct Fixture {
        state: ApiState,
        sensor: String,
        actuator: String,
        actuator_node: Arc<MockNode>,
    }

    async fn fixture() -> Fixture {
        let client = DeviceClient::new(ClientSettings::default()).unwrap();
        let registry = Arc::new(DeviceRegistry::new());

        let sensor_node = MockNode::new("sensor");
        sensor_node.set_reading(21.5);
        let sensor = serve(sensor_node).await;
        registry.add(sensor.clone(), client.connect(&sensor).await.unwrap()).await;

        let actuator_node = MockNode::new("actuator");
        let actuator = serve(actuator_node.clone()).await;
        registry.add(actuator.clone(), client.connect(&actuator).await.unwrap()).await;

        Fixture {
            state: ApiState {
                registry,
                services: Arc::new(ServiceMap::new()),
            },
            sensor,
            actuator,
            actuator_node,
        }
    }

    async fn call(state: &ApiState, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_list_devices() {
        let f = fixture().await;
        let (status, body) = call(&f.state, Method::GET, "/api/device", "").await;

        assert_eq!(status, StatusCode::OK);
        let devices = body["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.contains(&json!(f.sensor)));
    }

    #[tokio::test]
    async fn test_get_device_descriptor() {
        let f = fixture().await;
        let uri = format!("/api/device/{}", f.actuator);
        let (status, body) = call(&f.state, Method::GET, &uri, "").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "ip": f.actuator,
                "mac": "aa:aa:aa:aa:aa:aa",
                "service": "example",
                "type": "actuator",
            })
        );

        let (status, _) = call(&f.state, Method::GET, "/api/device/10.9.9.9", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sensor_reading() {
        let f = fixture().await;
        let (status, body) =
            call(&f.state, Method::GET, &format!("/api/sensor/{}", f.sensor), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "payload": 21.5 }));

        let (status, _) =
            call(&f.state, Method::GET, &format!("/api/sensor/{}", f.actuator), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_actuator() {
        let f = fixture().await;
        let uri = format!("/api/actuator/{}", f.actuator);

        let (status, body) = call(&f.state, Method::PUT, &uri, r#"{"payload": 3.5}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "payload": 3.5 }));
        assert_eq!(f.actuator_node.written(), vec![3.5]);

        let (status, body) = call(&f.state, Method::GET, &uri, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "payload": 3.5 }));
    }

    #[tokio::test]
    async fn test_put_actuator_rejects_bad_bodies() {
        let f = fixture().await;
        let uri = format!("/api/actuator/{}", f.actuator);

        for body in [r#"{"payload": 1, "extra": true}"#, "{", r#"{"payload": "x"}"#] {
            let (status, _) = call(&f.state, Method::PUT, &uri, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {}", body);
        }
        assert_eq!(f.actuator_node.writes(), 0);

        let (status, _) =
            call(&f.state, Method::PUT, "/api/actuator/10.9.9.9", r#"{"payload": 1}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let sensor_uri = format!("/api/actuator/{}", f.sensor);
        let (status, _) = call(&f.state, Method::PUT, &sensor_uri, r#"{"payload": 1}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_services() {
        let f = fixture().await;
        let (_, body) = call(&f.state, Method::GET, "/api/service", "").await;
        assert_eq!(body, json!([]));

        let handle = ServiceHandle::new(
            Path::new("/srv/lamp.so"),
            Arc::new(Recorder::new("lamp", &["lamp/state"])),
            1,
        );
        f.state.services.add(handle).await;

        let (status, body) = call(&f.state, Method::GET, "/api/service", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{
                "name": "/srv/lamp.so",
                "serviceName": "lamp",
                "version": "0.1.0",
                "topics": ["moody/device/lamp/state"],
            }])
        );
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let f = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = ApiHandle::spawn(listener, f.state.clone()).unwrap();

        let url = format!("http://{}/api/device", handle.local_addr());
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["devices"].as_array().unwrap().len(), 2);

        handle.stop().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
