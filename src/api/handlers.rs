use super::error::ApiError;
use super::ApiState;
use crate::device::{DataPacket, DeviceKind, NodeInfo};
use crate::service::ServiceInfo;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceDescriptor {
    #[serde(flatten)]
    pub node: NodeInfo,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
}

/// Body of an actuation request; unknown fields are rejected
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActuationRequest {
    pub payload: f64,
}

fn encode<T: Serialize>(value: &T) -> Result<Json<serde_json::Value>, ApiError> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError::Encoding(e.to_string()))
}

pub async fn list_devices(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    encode(&DevicesResponse {
        devices: state.registry.connected_addresses().await,
    })
}

pub async fn get_device(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = state.registry.get(&address).await.ok_or(ApiError::NotFound)?;
    encode(&DeviceDescriptor {
        node: device.node().info(),
        kind: device.kind(),
    })
}

pub async fn get_sensor(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = state.registry.get(&address).await.ok_or(ApiError::NotFound)?;
    let sensor = device.as_sensor().ok_or(ApiError::NotFound)?;
    encode(&DataPacket {
        payload: sensor.read().await,
    })
}

pub async fn get_actuator(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = state.registry.get(&address).await.ok_or(ApiError::NotFound)?;
    let actuator = device.as_actuator().ok_or(ApiError::NotFound)?;
    encode(&DataPacket {
        payload: actuator.state().await,
    })
}

pub async fn put_actuator(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = state.registry.get(&address).await.ok_or(ApiError::NotFound)?;
    let request: ActuationRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let actuator = device.as_actuator().ok_or(ApiError::NotFound)?;

    info!("API actuation of {} to {}", address, request.payload);
    actuator.actuate(request.payload).await;
    encode(&DataPacket {
        payload: request.payload,
    })
}

pub async fn list_services(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let services: Vec<ServiceInfo> = state.services.list().await;
    encode(&services)
}
