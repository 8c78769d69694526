//! HTTP surface of a federation node.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/federation/heartbeat` | Signed heartbeat from a peer |
//! | `POST` | `/federation/handover/intent` | New leader announcing a handover |
//! | `POST` | `/federation/handover/ack` | Old leader confirming it stepped down |
//! | `GET` | `/federation/status` | Role, epoch, peers, counters and handovers |
//! | `GET` | `/health` | Liveness |
//! | `POST` | `/orchestration/:action` | Privileged command, leader only |
//!
//! Federation endpoints answer 200 for any well-formed body and report verification in the
//! `valid` field. Orchestration requests pass through [`leader_gate`] first; a node that is
//! not the leader answers 403 without running anything.

use axum::{
    body::{to_bytes, Body},
    extract::{rejection::JsonRejection, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use federation_cluster::{
    communication::{HANDOVER_ACK_PATH, HANDOVER_INTENT_PATH, HEARTBEAT_PATH},
    Authorization, CommandAction, FederationNode, FederationStatus, HeartbeatRequest,
    HeartbeatResponse, NoticeKind, NoticeRequest, NoticeResponse, PrivilegedCommand,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::executor::{CommandExecutor, ExecutionReceipt, LeaderContext};

/// Largest orchestration body the gate will buffer
const MAX_COMMAND_BODY: usize = 64 * 1024;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    /// The local federation node
    pub node: Arc<FederationNode>,
    /// Runs commands the gate allowed
    pub executor: Arc<dyn CommandExecutor>,
}

/// Body of `POST /orchestration/:action`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// Deployment, container or network the action applies to
    pub target: String,
    /// Action-specific parameters, passed through untouched
    #[serde(default)]
    pub params: Value,
}

/// Build the node router
pub fn router(state: AppState) -> Router {
    let orchestration = Router::new()
        .route("/orchestration/:action", post(orchestrate))
        .route_layer(middleware::from_fn_with_state(state.clone(), leader_gate));

    Router::new()
        .route(HEARTBEAT_PATH, post(heartbeat))
        .route(HANDOVER_INTENT_PATH, post(handover_intent))
        .route(HANDOVER_ACK_PATH, post(handover_ack))
        .route("/federation/status", get(status))
        .route("/health", get(health))
        .merge(orchestration)
        .with_state(state)
}

async fn heartbeat(
    State(state): State<AppState>,
    request: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Json<HeartbeatResponse> {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            debug!(reason = %rejection.body_text(), "Undecodable heartbeat body");
            return Json(state.node.reject_malformed_heartbeat());
        },
    };
    let response = state.node.receive_heartbeat(&request);
    if !response.valid {
        debug!(from = %request.node_id, "Heartbeat rejected");
    }
    Json(response)
}

async fn handover_intent(
    State(state): State<AppState>,
    request: Result<Json<NoticeRequest>, JsonRejection>,
) -> Json<NoticeResponse> {
    Json(receive_notice(&state, NoticeKind::Intent, request))
}

async fn handover_ack(
    State(state): State<AppState>,
    request: Result<Json<NoticeRequest>, JsonRejection>,
) -> Json<NoticeResponse> {
    Json(receive_notice(&state, NoticeKind::Ack, request))
}

fn receive_notice(
    state: &AppState,
    kind: NoticeKind,
    request: Result<Json<NoticeRequest>, JsonRejection>,
) -> NoticeResponse {
    match request {
        Ok(Json(request)) => state.node.receive_notice(kind, &request),
        Err(rejection) => {
            debug!(?kind, reason = %rejection.body_text(), "Undecodable handover notice body");
            state.node.reject_malformed_notice()
        },
    }
}

async fn status(State(state): State<AppState>) -> Json<FederationStatus> {
    Json(state.node.status())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "node_id": state.node.node_id() }))
}

fn error_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Refuse orchestration requests unless this node is the leader
///
/// The body is buffered so the full command, target included, goes through the gate. The
/// resulting [`Authorization`] is attached to the request for the handler.
pub async fn leader_gate(
    State(state): State<AppState>,
    Path(action): Path<String>,
    request: Request,
    next: Next,
) -> Response {
    let Ok(action) = action.parse::<CommandAction>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            json!({ "error": "unknown_action", "action": action }),
        );
    };

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_COMMAND_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "error": "body_rejected", "reason": e.to_string() }),
            );
        },
    };
    let body: OrchestrationRequest = match serde_json::from_slice(&bytes) {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_body", "reason": e.to_string() }),
            );
        },
    };

    let authorization = state.node.gate().authorize(&PrivilegedCommand::new(action, body.target));
    if !authorization.allow {
        return error_response(
            StatusCode::FORBIDDEN,
            json!({
                "error": "not_leader",
                "leader_id": authorization.leader_id,
                "reason": authorization.reason,
            }),
        );
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(authorization);
    next.run(request).await
}

async fn orchestrate(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Extension(authorization): Extension<Authorization>,
    Json(body): Json<OrchestrationRequest>,
) -> Response {
    let Ok(action) = action.parse::<CommandAction>() else {
        return error_response(StatusCode::NOT_FOUND, json!({ "error": "unknown_action" }));
    };

    // Leadership may have been lost between the gate and here
    let role = state.node.role().snapshot();
    let Some(lease_token) = role.lease_token.filter(|_| role.role.is_leader()) else {
        return error_response(
            StatusCode::FORBIDDEN,
            json!({
                "error": "not_leader",
                "leader_id": role.leader_id,
                "reason": "leadership lost before execution",
            }),
        );
    };

    let command = PrivilegedCommand::new(action, body.target);
    let leader = LeaderContext {
        leader_id: state.node.node_id().clone(),
        epoch: role.current_epoch,
        lease_token,
    };

    match state.executor.execute(&command, &leader).await {
        Ok(receipt) => {
            let ExecutionReceipt { command, leader_id, epoch, executed_at } = receipt;
            Json(json!({
                "ok": true,
                "action": command.action,
                "target": command.target,
                "leader_id": leader_id,
                "epoch": epoch,
                "executed_at": executed_at,
                "authorization": authorization.reason,
            }))
            .into_response()
        },
        Err(e) => {
            warn!(action = %command.action, target = %command.target, error = %e, "Command execution failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                json!({ "error": "execution_failed", "reason": e.to_string() }),
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LoggingExecutor;
    use axum::http::{header, Method, Request as HttpRequest};
    use federation_cluster::{
        test_utils::{TestFederation, TEST_CLUSTER_ROOT, TEST_SEAL},
        time::unix_seconds,
        Clock, ClusterSeal, Epoch, HeartbeatMessage, NodeId, PassTrigger,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(fed: &TestFederation, id: &str) -> (Router, Arc<LoggingExecutor>) {
        let executor = Arc::new(LoggingExecutor::new());
        let state = AppState {
            node: fed.node(id),
            executor: Arc::clone(&executor) as Arc<dyn CommandExecutor>,
        };
        (router(state), executor)
    }

    fn post_json(uri: &str, body: &Value) -> Request {
        HttpRequest::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn heartbeat_body(fed: &TestFederation, from: &str, root: &str) -> Value {
        let seal = ClusterSeal::new(TEST_SEAL, Duration::from_secs(300)).unwrap();
        let hb = HeartbeatMessage::signed(
            &seal,
            NodeId::from(from),
            Epoch::new(42),
            unix_seconds(fed.clock.now()),
        );
        serde_json::to_value(HeartbeatRequest::from_message(&hb, root)).unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_accepted() {
        let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
        let (app, _) = app(&fed, "node-a");

        let body = heartbeat_body(&fed, "node-b", TEST_CLUSTER_ROOT);
        let resp = app.oneshot(post_json(HEARTBEAT_PATH, &body)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["valid"], true);
        assert_eq!(fed.node("node-a").peer_view().peers().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_heartbeat_still_answers_ok() {
        let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
        let (app, _) = app(&fed, "node-a");

        let body = heartbeat_body(&fed, "node-b", "other-cluster");
        let resp = app.oneshot(post_json(HEARTBEAT_PATH, &body)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["valid"], false);
    }

    #[tokio::test]
    async fn test_undecodable_heartbeat_counted_as_malformed() {
        let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
        let (app, _) = app(&fed, "node-a");
        let mut body = heartbeat_body(&fed, "node-b", TEST_CLUSTER_ROOT);
        body["epoch"] = json!(-1);

        let resp = app.oneshot(post_json(HEARTBEAT_PATH, &body)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["valid"], false);
        assert_eq!(fed.node("node-a").status().stats.ingress.rejected_malformed, 1);
        assert!(fed.node("node-a").peer_view().peers().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_notice_counted_as_malformed() {
        let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
        let (app, _) = app(&fed, "node-a");

        let resp = app
            .oneshot(post_json(HANDOVER_INTENT_PATH, &json!({ "cluster_root": TEST_CLUSTER_ROOT })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["valid"], false);
        assert_eq!(fed.node("node-a").status().stats.ingress.rejected_malformed, 1);
    }

    #[tokio::test]
    async fn test_status_reports_role() {
        let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
        let (app, _) = app(&fed, "node-b");

        let req = HttpRequest::builder().uri("/federation/status").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["node_id"], "node-b");
        assert_eq!(body["role"], "witness");
    }

    #[tokio::test]
    async fn test_health() {
        let fed = TestFederation::new(&["node-a"]).unwrap();
        let (app, _) = app(&fed, "node-a");

        let req = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_witness_refuses_orchestration() {
        let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
        let (app, executor) = app(&fed, "node-b");

        let resp = app
            .oneshot(post_json("/orchestration/deploy", &json!({ "target": "web" })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"], "not_leader");
        assert!(executor.executed().is_empty());
        assert_eq!(fed.node("node-b").gate().stats().denied, 1);
    }

    #[tokio::test]
    async fn test_leader_executes_orchestration() {
        let fed = TestFederation::new(&["node-a"]).unwrap();
        fed.node("node-a").coordinator().run_pass(PassTrigger::Manual).await.unwrap();
        let (app, executor) = app(&fed, "node-a");

        let resp = app
            .oneshot(post_json("/orchestration/container-restart", &json!({ "target": "api" })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["action"], "container_restart");
        assert_eq!(body["leader_id"], "node-a");
        let executed = executor.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].command.action, CommandAction::ContainerRestart);
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let fed = TestFederation::new(&["node-a"]).unwrap();
        let (app, _) = app(&fed, "node-a");

        let resp = app
            .oneshot(post_json("/orchestration/format-disk", &json!({ "target": "sda" })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "unknown_action");
    }

    #[tokio::test]
    async fn test_malformed_command_body_rejected() {
        let fed = TestFederation::new(&["node-a"]).unwrap();
        fed.node("node-a").coordinator().run_pass(PassTrigger::Manual).await.unwrap();
        let (app, executor) = app(&fed, "node-a");

        let resp = app
            .oneshot(post_json("/orchestration/deploy", &json!({ "name": "web" })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(executor.executed().is_empty());
    }
}
