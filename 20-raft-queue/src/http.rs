//! REST adapter over [`Store`].
//!
//! | Route            | Body                        | Success |
//! |------------------|-----------------------------|---------|
//! | `POST /send`     | payload                     | 201     |
//! | `GET /receive`   |                             | 200     |
//! | `GET /stats`     |                             | 200     |
//! | `POST /join`     | `{"id": 2, "address": ".."}`| 201     |
//! | `POST /remove`   | `{"id": 2}`                 | 200     |
//!
//! Failures answer `{"error": ".."}` with 503 when this node is not the
//! leader, 504 when the outcome is unknown, and 500 otherwise. Store calls
//! block until the log commits, so handlers run them on the blocking pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::store::{Payload, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: u64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub id: u64,
}

/// A store error as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => {
                warn!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router<T: Payload + Default>(store: Arc<Store<T>>) -> Router {
    Router::new()
        .route("/send", post(send::<T>))
        .route("/receive", get(receive::<T>))
        .route("/stats", get(stats::<T>))
        .route("/join", post(join::<T>))
        .route("/remove", post(remove::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serves the router on `listener` until `shutdown` resolves, then drains
/// in-flight requests.
pub async fn serve<T, F>(listener: TcpListener, store: Arc<Store<T>>, shutdown: F) -> io::Result<()>
where
    T: Payload + Default,
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn blocking<T, R, F>(store: Arc<Store<T>>, call: F) -> Result<R, ApiError>
where
    T: Payload,
    R: Send + 'static,
    F: FnOnce(&Store<T>) -> Result<R> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || call(&store)).await;
    match joined {
        Ok(result) => result.map_err(ApiError),
        Err(err) => Err(ApiError(Error::Io(io::Error::new(io::ErrorKind::Other, err)))),
    }
}

async fn send<T: Payload>(
    State(store): State<Arc<Store<T>>>,
    Json(data): Json<T>,
) -> Result<StatusCode, ApiError> {
    blocking(store, move |store| store.send(data)).await?;
    Ok(StatusCode::CREATED)
}

/// An empty queue answers the zero-value message rather than an error.
async fn receive<T: Payload + Default>(
    State(store): State<Arc<Store<T>>>,
) -> Result<Json<Message<T>>, ApiError> {
    let message = blocking(store, |store| store.receive()).await?;
    Ok(Json(message.unwrap_or_default()))
}

async fn stats<T: Payload>(
    State(store): State<Arc<Store<T>>>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let stats = blocking(store, |store| store.stats()).await?;
    Ok(Json(stats))
}

async fn join<T: Payload>(
    State(store): State<Arc<Store<T>>>,
    Json(request): Json<JoinRequest>,
) -> Result<StatusCode, ApiError> {
    blocking(store, move |store| store.join(request.id, &request.address)).await?;
    Ok(StatusCode::CREATED)
}

async fn remove<T: Payload>(
    State(store): State<Arc<Store<T>>>,
    Json(request): Json<RemoveRequest>,
) -> Result<StatusCode, ApiError> {
    blocking(store, move |store| store.remove(request.id)).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    use super::*;
    use crate::config::NodeConfig;
    use crate::message::Comment;

    fn leader() -> anyhow::Result<Arc<Store<Comment>>> {
        let store = Store::start(NodeConfig::new(1, "127.0.0.1:0").bootstrap(true))?;
        store.wait_for_leader(Duration::from_secs(10))?;
        Ok(Arc::new(store))
    }

    fn post_json(uri: &str, body: &impl Serialize) -> anyhow::Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?)
    }

    fn get(uri: &str) -> anyhow::Result<Request<Body>> {
        Ok(Request::builder().uri(uri).body(Body::empty())?)
    }

    async fn json_body<B: DeserializeOwned>(response: Response) -> anyhow::Result<B> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_receive_and_stats() -> anyhow::Result<()> {
        let store = leader()?;
        let app = router(Arc::clone(&store));

        let comment = Comment::new("Alice", "hi");
        let response = app.clone().oneshot(post_json("/send", &comment)?).await?;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.clone().oneshot(get("/receive")?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let message: Message<Comment> = json_body(response).await?;
        assert_eq!(message.data, comment);

        let response = app.clone().oneshot(get("/receive")?).await?;
        let empty: serde_json::Value = json_body(response).await?;
        assert_eq!(empty, serde_json::json!({ "data": {} }));

        let response = app.clone().oneshot(get("/stats")?).await?;
        let stats: BTreeMap<String, String> = json_body(response).await?;
        assert_eq!(stats["state"], "Leader");
        assert_eq!(stats["num_peers"], "0");

        store.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn joining_an_existing_member_is_accepted() -> anyhow::Result<()> {
        let store = leader()?;
        let app = router(Arc::clone(&store));

        let request = JoinRequest {
            id: 1,
            address: store.raft_addr().to_string(),
        };
        let response = app.clone().oneshot(post_json("/join", &request)?).await?;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.oneshot(post_json("/remove", &RemoveRequest { id: 9 })?).await?;
        assert_eq!(response.status(), StatusCode::OK);

        store.stop();
        Ok(())
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() -> anyhow::Result<()> {
        let cases = [
            (Error::NotLeader { leader: Some(2) }, StatusCode::SERVICE_UNAVAILABLE),
            (Error::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (Error::UnknownOperation(7), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), status);
            let body: serde_json::Value = json_body(response).await?;
            assert!(body["error"].is_string());
        }
        Ok(())
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected() -> anyhow::Result<()> {
        let store = tokio::task::spawn_blocking(leader).await??;
        let app = router(Arc::clone(&store));

        let request = Request::builder()
            .method("POST")
            .uri("/join")
            .header("content-type", "application/json")
            .body(Body::from("{\"id\": \"two\"}"))?;
        let response = app.oneshot(request).await?;
        assert!(response.status().is_client_error());

        tokio::task::spawn_blocking(move || store.stop()).await?;
        Ok(())
    }
}
