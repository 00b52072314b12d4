//! Hub HTTP surface: agent registration, message delivery and status.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::registry::AgentInfo;
use super::{Delivery, Hub};
use crate::error::Result;

/// Largest accepted message body.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Build the hub router.
pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(status).post(status_post))
        .route("/register/:agent", put(register))
        .route("/message/:user", post(message_post))
        .route("/message/:user/*text", get(message_get).post(message_post_tail))
        .route("/agents", get(agents))
        .route("/health", get(health_check))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Serve the hub on `listen` until the listener fails.
pub async fn run_server(hub: Arc<Hub>, listen: SocketAddr) -> Result<()> {
    let app = create_router(hub);

    tracing::info!("Starting hub HTTP server on {}", listen);
    let listener = tokio::net::TcpListener::bind(listen).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(hub): State<Arc<Hub>>) -> (StatusCode, String) {
    match hub.status_text().await {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
    }
}

async fn status_post() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "POST needs username\n")
}

async fn agents(State(hub): State<Arc<Hub>>) -> Json<Vec<AgentInfo>> {
    Json(hub.agents().await)
}

/// `PUT /register/<agent>?port=P`: the agent is reached back at the
/// address the request came from.
async fn register(
    State(hub): State<Arc<Hub>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(agent): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let port = match params.get("port").map(|p| p.parse::<u16>()) {
        Some(Ok(port)) if port != 0 => port,
        Some(_) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("invalid port for \"{}\"\n", agent),
            )
        }
        None => {
            return (
                StatusCode::BAD_REQUEST,
                format!("missing port for \"{}\"\n", agent),
            )
        }
    };

    let address = agent_address(peer, port);
    hub.register_agent(&agent, &address).await;
    (
        StatusCode::OK,
        format!("registered \"{}\" at \"{}\"\n", agent, address),
    )
}

fn agent_address(peer: SocketAddr, port: u16) -> String {
    let ip = peer.ip().to_canonical();
    format!("http://{}", SocketAddr::new(ip, port))
}

async fn message_post(
    State(hub): State<Arc<Hub>>,
    Path(user): Path<String>,
    body: String,
) -> (StatusCode, String) {
    deliver(&hub, &user, &body).await
}

/// POSTs below `/message/<user>/` deliver the body; the tail is ignored.
async fn message_post_tail(
    State(hub): State<Arc<Hub>>,
    Path((user, _tail)): Path<(String, String)>,
    body: String,
) -> (StatusCode, String) {
    deliver(&hub, &user, &body).await
}

async fn message_get(
    State(hub): State<Arc<Hub>>,
    Path((user, text)): Path<(String, String)>,
) -> (StatusCode, String) {
    deliver(&hub, &user, &text).await
}

async fn deliver(hub: &Hub, user: &str, text: &str) -> (StatusCode, String) {
    if text.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty message\n".to_string());
    }

    match hub.deliver_or_queue(user, text).await {
        Ok(Delivery::Sent) => (StatusCode::CREATED, format!("sent to {}\n", user)),
        Ok(Delivery::Queued) => (StatusCode::OK, format!("queued for {}\n", user)),
        Err(e) => {
            tracing::error!("Could not queue message for {}: {}", user, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to queue message for {}: {}\n", user, e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{hub_with, private};
    use crate::hub::HubOptions;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn request(method: Method, uri: &str, body: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 40000))));
        req
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn register_uses_peer_address() {
        let dir = TempDir::new().unwrap();
        let (hub, _) = hub_with(&dir, HubOptions::default());
        let app = create_router(hub.clone());

        let (status, body) = call(app, request(Method::PUT, "/register/box?port=8685", "")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "registered \"box\" at \"http://10.0.0.5:8685\"\n");
        assert_eq!(hub.agents().await[0].address, "http://10.0.0.5:8685");
    }

    #[tokio::test]
    async fn register_rejects_bad_port() {
        let dir = TempDir::new().unwrap();
        let (hub, _) = hub_with(&dir, HubOptions::default());

        for uri in ["/register/box", "/register/box?port=x", "/register/box?port=70000"] {
            let (status, _) = call(create_router(hub.clone()), request(Method::PUT, uri, "")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        }
        assert!(hub.agents().await.is_empty());
    }

    #[test]
    fn ipv6_peers_are_bracketed() {
        let peer: SocketAddr = "[fd00::1]:5000".parse().unwrap();
        assert_eq!(agent_address(peer, 9), "http://[fd00::1]:9");

        let mapped: SocketAddr = "[::ffff:10.1.2.3]:5000".parse().unwrap();
        assert_eq!(agent_address(mapped, 9), "http://10.1.2.3:9");
    }

    #[tokio::test]
    async fn message_is_queued_then_sent_live() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());

        let (status, _) = call(
            create_router(hub.clone()),
            request(Method::POST, "/message/alice", "disk full"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hub.state().await.store.queue("alice"), &["disk full"]);

        hub.handle_message(private("alice", 42, "hi")).await;
        let (status, _) = call(
            create_router(hub.clone()),
            request(Method::GET, "/message/alice/backup%20done", ""),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            messenger.sent(),
            vec![(42, "disk full".to_string()), (42, "backup done".to_string())]
        );
    }

    #[tokio::test]
    async fn only_empty_message_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (hub, _) = hub_with(&dir, HubOptions::default());

        let (status, _) = call(
            create_router(hub.clone()),
            request(Method::POST, "/message/alice", ""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(hub.state().await.store.queues().is_empty());

        let (status, _) = call(
            create_router(hub.clone()),
            request(Method::POST, "/message/alice", "  \n"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hub.state().await.store.queue("alice"), &["  \n"]);
    }

    #[tokio::test]
    async fn post_with_path_tail_delivers_body() {
        let dir = TempDir::new().unwrap();
        let (hub, _) = hub_with(&dir, HubOptions::default());

        let (status, body) = call(
            create_router(hub.clone()),
            request(Method::POST, "/message/alice/from-cron", "nightly backup ok"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "queued for alice\n");
        assert_eq!(hub.state().await.store.queue("alice"), &["nightly backup ok"]);
    }

    #[tokio::test]
    async fn root_shows_status_and_rejects_post() {
        let dir = TempDir::new().unwrap();
        let (hub, _) = hub_with(&dir, HubOptions::default());
        hub.deliver_or_queue("bob", "x").await.unwrap();

        let (status, body) = call(create_router(hub.clone()), request(Method::GET, "/", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]\n{\"bob\":[\"x\"]}\n");

        let (status, body) = call(create_router(hub), request(Method::POST, "/", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "POST needs username\n");
    }

    #[tokio::test]
    async fn agents_listing_is_sorted_json() {
        let dir = TempDir::new().unwrap();
        let (hub, _) = hub_with(&dir, HubOptions::default());
        hub.register_agent("web", "http://10.0.0.2:1").await;
        hub.register_agent("db", "http://10.0.0.3:1").await;

        let (status, body) = call(create_router(hub), request(Method::GET, "/agents", "")).await;

        assert_eq!(status, StatusCode::OK);
        let agents: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(agents[0]["name"], "db");
        assert_eq!(agents[1]["name"], "web");
        assert_eq!(agents[1]["stale"], false);
    }
}
