use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;

use super::protocol::{
    AppendEpochRequest, ENDPOINT_APPEND_EPOCH, ENDPOINT_EPOCH_TREE, ENDPOINT_EPOCH_TREE_LAST_VALID,
    ENDPOINT_GET, ENDPOINT_GET_VALUE, ENDPOINT_HEALTH, ENDPOINT_SET, ENDPOINT_SET_VALUE,
    ENDPOINT_STREAM_BUCKETS, EpochTreeLastValidResponse, EpochTreeRequest, ErrorResponse,
    GetResponse, GetValueResponse, SetRequest, SetValueRequest, SetValueResponse,
    StreamBucketsRequest, StreamBucketsResponse,
};
use crate::error::{ClusterError, Result};
use crate::node::types::{NodeRequest, RequestSender};

/// All client and internal routes of one node.
pub fn router(sender: RequestSender) -> Router {
    Router::new()
        .route(ENDPOINT_SET, post(handle_set))
        .route(&format!("{}/:key", ENDPOINT_GET), get(handle_get))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_SET_VALUE, post(handle_set_value))
        .route(&format!("{}/:key", ENDPOINT_GET_VALUE), get(handle_get_value))
        .route(ENDPOINT_STREAM_BUCKETS, post(handle_stream_buckets))
        .route(ENDPOINT_EPOCH_TREE, post(handle_epoch_tree))
        .route(
            &format!("{}/:partition", ENDPOINT_EPOCH_TREE_LAST_VALID),
            get(handle_epoch_tree_last_valid),
        )
        .route(ENDPOINT_APPEND_EPOCH, post(handle_append_epoch))
        .layer(Extension(sender))
}

/// HTTP status for each error class. Channel and quorum timeouts are resource exhaustion.
pub fn status_for(err: &ClusterError) -> StatusCode {
    match err {
        ClusterError::Timeout(_) | ClusterError::NotLeader | ClusterError::NoMembers => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ClusterError::Stale(_) | ClusterError::Busy(_) => StatusCode::CONFLICT,
        ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::Unreachable { .. } => StatusCode::BAD_GATEWAY,
        ClusterError::Encoding(_) | ClusterError::Config(_) => StatusCode::BAD_REQUEST,
        ClusterError::Invariant(_) | ClusterError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => {
            if e.is_expected() {
                tracing::debug!("Request answered with {}", e);
            } else {
                tracing::warn!("Request failed: {}", e);
            }
            (status_for(&e), Json(ErrorResponse::from(&e))).into_response()
        }
    }
}

pub async fn handle_set(
    Extension(sender): Extension<RequestSender>,
    Json(req): Json<SetRequest>,
) -> Response {
    let result = sender
        .call(|reply| NodeRequest::Set {
            key: req.key,
            value: req.value.into_bytes(),
            reply,
        })
        .await;
    respond(result)
}

pub async fn handle_get(
    Extension(sender): Extension<RequestSender>,
    Path(key): Path<String>,
) -> Response {
    let result = sender
        .call(|reply| NodeRequest::Get {
            key: key.clone(),
            reply,
        })
        .await;

    match result {
        Ok(record) => respond(Ok(GetResponse {
            key: record.key,
            value: Some(String::from_utf8_lossy(&record.value).into_owned()),
            epoch: record.epoch,
            timestamp: record.timestamp,
        })),
        Err(ClusterError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(GetResponse {
                key,
                value: None,
                epoch: 0,
                timestamp: 0,
            }),
        )
            .into_response(),
        Err(e) => respond::<GetResponse>(Err(e)),
    }
}

pub async fn handle_health(Extension(sender): Extension<RequestSender>) -> Response {
    match sender.call(|reply| NodeRequest::Health { reply }).await {
        Ok(health) if health.healthy => (StatusCode::OK, Json(health)).into_response(),
        Ok(health) => (StatusCode::SERVICE_UNAVAILABLE, Json(health)).into_response(),
        Err(e) => respond::<()>(Err(e)),
    }
}

pub async fn handle_set_value(
    Extension(sender): Extension<RequestSender>,
    Json(req): Json<SetValueRequest>,
) -> Response {
    let result = sender
        .call(|reply| NodeRequest::SetValue {
            partition: req.partition,
            record: req.record,
            reply,
        })
        .await;
    respond(result.map(|written| SetValueResponse { written }))
}

pub async fn handle_get_value(
    Extension(sender): Extension<RequestSender>,
    Path(key): Path<String>,
) -> Response {
    let result = sender.call(|reply| NodeRequest::GetValue { key, reply }).await;
    respond(result.map(|record| GetValueResponse { record }))
}

pub async fn handle_stream_buckets(
    Extension(sender): Extension<RequestSender>,
    Json(request): Json<StreamBucketsRequest>,
) -> Response {
    let result = sender
        .call(|reply| NodeRequest::StreamBuckets { request, reply })
        .await;
    respond(result.map(|records| StreamBucketsResponse { records }))
}

pub async fn handle_epoch_tree(
    Extension(sender): Extension<RequestSender>,
    Json(request): Json<EpochTreeRequest>,
) -> Response {
    respond(
        sender
            .call(|reply| NodeRequest::EpochTree { request, reply })
            .await,
    )
}

pub async fn handle_epoch_tree_last_valid(
    Extension(sender): Extension<RequestSender>,
    Path(partition): Path<u32>,
) -> Response {
    let result = sender
        .call(|reply| NodeRequest::EpochTreeLastValid { partition, reply })
        .await;
    respond(result.map(|tree| EpochTreeLastValidResponse { tree }))
}

pub async fn handle_append_epoch(
    Extension(sender): Extension<RequestSender>,
    Json(request): Json<AppendEpochRequest>,
) -> Response {
    let result = sender
        .call(|reply| NodeRequest::AppendEpoch { request, reply })
        .await;
    respond(result.map(|()| serde_json::json!({ "appended": true })))
}
