//! HTTP API over the endpoint manager

use endpoint_core::{
    Endpoint, EndpointRef, EndpointSpec, Error, LocalEndpoint, NotificationKind, Owner,
    PolicyEndpoint, RegenerationLevel, RegenerationMetadata,
};
use endpoint_manager::EndpointManager;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const ENDPOINT_PATH: &str = "/v1/endpoint";

/// Logs agent notifications
pub struct LogOwner;

impl Owner for LogOwner {
    fn send_notification(&self, kind: NotificationKind, payload: String) {
        info!(kind = %kind, payload = %payload, "Agent notification");
    }
}

/// Shared state of the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<EndpointManager>,
    pub owner: Arc<dyn Owner>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointModel {
    id: u16,
    container_id: Option<String>,
    pod_name: Option<String>,
    identifiers: BTreeMap<String, String>,
    policy_revision: u64,
}

impl From<&EndpointRef> for EndpointModel {
    fn from(ep: &EndpointRef) -> Self {
        Self {
            id: ep.id(),
            container_id: ep.container_id(),
            pod_name: ep.pod_name(),
            identifiers: ep
                .identifiers()
                .into_iter()
                .map(|(prefix, value)| (prefix.to_string(), value))
                .collect(),
            policy_revision: ep.policy_revision(),
        }
    }
}

pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: ApiState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let body = req.into_body().collect().await?.to_bytes();
    Ok(route(&state, &method, &path, body).await)
}

/// Dispatch a request to its handler
pub async fn route(state: &ApiState, method: &Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
    if path == "/healthz" {
        return text(StatusCode::OK, "OK\n");
    }

    let Some(rest) = path.strip_prefix(ENDPOINT_PATH) else {
        return text(StatusCode::NOT_FOUND, "Not Found\n");
    };

    let sub = match rest {
        "" => "",
        _ => match rest.strip_prefix('/') {
            Some(sub) => sub,
            None => return text(StatusCode::NOT_FOUND, "Not Found\n"),
        },
    };

    match (method, sub) {
        (&Method::GET, "") => list_endpoints(state),
        (&Method::PUT, "") => create_endpoint(state, &body),
        (&Method::POST, "regenerate") => regenerate_endpoints(state),
        (&Method::GET, id) if !id.is_empty() => get_endpoint(state, id),
        (&Method::DELETE, id) if !id.is_empty() => delete_endpoint(state, id).await,
        _ => text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n"),
    }
}

fn list_endpoints(state: &ApiState) -> Response<Full<Bytes>> {
    let mut models: Vec<EndpointModel> = state
        .manager
        .get_endpoints()
        .iter()
        .map(EndpointModel::from)
        .collect();
    models.sort_by_key(|m| m.id);
    json(StatusCode::OK, &models)
}

fn get_endpoint(state: &ApiState, compound_id: &str) -> Response<Full<Bytes>> {
    match state.manager.lookup(compound_id) {
        Ok(Some(ep)) => json(StatusCode::OK, &EndpointModel::from(&ep)),
        Ok(None) => text(StatusCode::NOT_FOUND, "Endpoint not found\n"),
        Err(e) => lookup_error(e),
    }
}

fn create_endpoint(state: &ApiState, body: &Bytes) -> Response<Full<Bytes>> {
    let spec: EndpointSpec = match serde_json::from_slice(body) {
        Ok(spec) => spec,
        Err(e) => return text(StatusCode::BAD_REQUEST, &format!("Invalid endpoint: {}\n", e)),
    };
    if let Err(e) = spec.validate() {
        return text(StatusCode::BAD_REQUEST, &format!("Invalid endpoint: {}\n", e));
    }

    let ep: EndpointRef = LocalEndpoint::new(spec);
    match state
        .manager
        .add_endpoint(&*state.owner, ep.clone(), "created via API")
    {
        Ok(()) => json(StatusCode::CREATED, &EndpointModel::from(&ep)),
        Err(e @ Error::IdPoolExhausted) => text(StatusCode::SERVICE_UNAVAILABLE, &format!("{}\n", e)),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e)),
    }
}

async fn delete_endpoint(state: &ApiState, compound_id: &str) -> Response<Full<Bytes>> {
    match state.manager.lookup(compound_id) {
        Ok(Some(ep)) => {
            state.manager.wait_endpoint_removed(&*ep).await;
            info!(endpoint_id = ep.id(), "Endpoint deleted via API");
            text(StatusCode::OK, "Deleted\n")
        }
        Ok(None) => text(StatusCode::NOT_FOUND, "Endpoint not found\n"),
        Err(e) => lookup_error(e),
    }
}

fn regenerate_endpoints(state: &ApiState) -> Response<Full<Bytes>> {
    // Completion is not awaited; the caller polls policy revisions.
    let _handle = state.manager.regenerate_all_endpoints(RegenerationMetadata::new(
        "regeneration requested via API",
        RegenerationLevel::WithDatapathRewrite,
    ));
    text(StatusCode::ACCEPTED, "Regeneration triggered\n")
}

fn lookup_error(e: Error) -> Response<Full<Bytes>> {
    let status = match e {
        Error::UnsupportedId => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_REQUEST,
    };
    text(status, &format!("{}\n", e))
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e)),
    }
}
