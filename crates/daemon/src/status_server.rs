//! Status HTTP server.
//!
//! Read-only view of the queue plus a requeue action for items parked in
//! Review or Failed.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::queue::{QueueError, QueueItem, QueueStats, QueueStatus, QueueStore};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind status server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("status server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::NotRequeueable { .. } => StatusCode::CONFLICT,
            QueueError::Io(_) | QueueError::Serialize(_) | QueueError::Task(_) => {
                error!(error = %self.0, "Status request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ItemsQuery {
    status: Option<QueueStatus>,
}

async fn get_stats(State(store): State<Arc<QueueStore>>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(store.run_blocking(|s| s.get_queue_stats()).await?))
}

async fn list_items(
    State(store): State<Arc<QueueStore>>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<QueueItem>>, ApiError> {
    let items = store
        .run_blocking(move |s| match query.status {
            Some(status) => s.get_by_status(status),
            None => s.all(),
        })
        .await?;
    Ok(Json(items))
}

async fn get_item(
    State(store): State<Arc<QueueStore>>,
    Path(item_id): Path<u64>,
) -> Result<Json<QueueItem>, ApiError> {
    store
        .run_blocking(move |s| s.get(item_id))
        .await?
        .map(Json)
        .ok_or(ApiError(QueueError::NotFound(item_id)))
}

async fn requeue_item(
    State(store): State<Arc<QueueStore>>,
    Path(item_id): Path<u64>,
) -> Result<Json<QueueItem>, ApiError> {
    Ok(Json(store.run_blocking(move |s| s.requeue(item_id)).await?))
}

pub fn create_status_router(store: Arc<QueueStore>) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/items", get(list_items))
        .route("/items/:id", get(get_item))
        .route("/items/:id/requeue", post(requeue_item))
        .with_state(store)
}

/// Serves the status API on `bind` until `shutdown` flips to true.
pub async fn run_status_server(
    store: Arc<QueueStore>,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = bind, "Status server listening");

    axum::serve(listener, create_status_router(store))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(ServerError::Serve)?;

    info!("Status server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn store() -> (TempDir, Arc<QueueStore>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path().join("queue")).unwrap());
        (tmp, store)
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_stats_counts_every_status() {
        let (_tmp, store) = store();
        store.add("Heat").unwrap();
        let mut item = store.add("Ronin").unwrap();
        item.status = QueueStatus::Failed;
        store.update(&item).unwrap();

        let (status, body) = send(create_status_router(store), "GET", "/stats").await;
        assert_eq!(status, StatusCode::OK);

        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["failed"], 1);
        assert_eq!(stats["completed"], 0);
        assert_eq!(stats.as_object().unwrap().len(), QueueStatus::ALL.len());
    }

    #[tokio::test]
    async fn test_list_items_with_status_filter() {
        let (_tmp, store) = store();
        store.add("Heat").unwrap();
        let mut item = store.add("Ronin").unwrap();
        item.status = QueueStatus::Review;
        store.update(&item).unwrap();

        let (status, body) = send(create_status_router(store.clone()), "GET", "/items").await;
        assert_eq!(status, StatusCode::OK);
        let items: Vec<QueueItem> = serde_json::from_slice(&body).unwrap();
        assert_eq!(items.len(), 2);

        let (_, body) = send(create_status_router(store), "GET", "/items?status=review").await;
        let items: Vec<QueueItem> = serde_json::from_slice(&body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].disc_title, "Ronin");
    }

    #[tokio::test]
    async fn test_get_item_and_not_found() {
        let (_tmp, store) = store();
        let item = store.add("Heat").unwrap();

        let uri = format!("/items/{}", item.item_id);
        let (status, body) = send(create_status_router(store.clone()), "GET", &uri).await;
        assert_eq!(status, StatusCode::OK);
        let fetched: QueueItem = serde_json::from_slice(&body).unwrap();
        assert_eq!(fetched, item);

        let (status, body) = send(create_status_router(store), "GET", "/items/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(error.error.contains("999"));
    }

    #[tokio::test]
    async fn test_requeue_endpoint() {
        let (_tmp, store) = store();
        let mut item = store.add("Heat").unwrap();

        let uri = format!("/items/{}/requeue", item.item_id);
        let (status, _) = send(create_status_router(store.clone()), "POST", &uri).await;
        assert_eq!(status, StatusCode::CONFLICT);

        item.status = QueueStatus::Failed;
        item.error_message = Some("rip failed".to_string());
        store.update(&item).unwrap();

        let (status, body) = send(create_status_router(store.clone()), "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        let requeued: QueueItem = serde_json::from_slice(&body).unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.error_message, None);
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let (_tmp, store) = store();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(async move { run_status_server(store, "127.0.0.1:0", rx).await });

        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
