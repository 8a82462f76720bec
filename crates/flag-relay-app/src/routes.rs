//! HTTP surface of the relay.
//!
//! Streaming endpoints resolve a credential to a broadcast hub handler and
//! hand the connection over; event endpoints resolve to the environment's
//! relay and accept the batch. A credential that matches no environment is
//! a 401; a known key presented to the wrong endpoint kind, or an unknown
//! filter, is a 404 ("not my endpoint").

use actix_web::http::Method;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::debug;

use flag_relay_core::credential::Credential;
use flag_relay_core::environment::FilterKey;
use flag_relay_core::error::RelayError;
use flag_relay_events::ingestion;
use flag_relay_stream::audience::Audience;

use crate::relay::RelayEnvironments;

/// Optional payload-filter selector on streaming requests.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    filter: String,
}

impl StreamQuery {
    fn filter_key(&self) -> FilterKey {
        FilterKey::new(self.filter.clone())
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    let report = Method::from_bytes(b"REPORT").expect("REPORT is a valid method");
    cfg.route("/all", web::get().to(stream_server_all))
        .route("/flags", web::get().to(stream_server_flags))
        .route("/meval/{context}", web::get().to(stream_mobile))
        .route("/meval", web::method(report.clone()).to(stream_mobile))
        .route("/eval/{env_id}/{context}", web::get().to(stream_js_client))
        .route("/eval/{env_id}", web::method(report).to(stream_js_client))
        .route("/bulk", web::post().to(post_server_events))
        .route("/mobile", web::post().to(post_mobile_events))
        .route("/events/bulk/{env_id}", web::post().to(post_js_client_events));
}

fn authorization(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn path_env_id(req: &HttpRequest) -> Option<String> {
    req.match_info().get("env_id").map(str::to_string)
}

async fn respond_stream(
    state: &RelayEnvironments,
    audience: Audience,
    credential: Option<Credential>,
    filter: FilterKey,
    req: &HttpRequest,
) -> HttpResponse {
    let Some(credential) = credential else {
        return HttpResponse::Unauthorized().finish();
    };
    match state.stream_handler(audience, &credential, &filter) {
        Ok(handler) => handler.respond(req).await,
        Err(RelayError::Unauthorized) => HttpResponse::Unauthorized().finish(),
        Err(err) => {
            debug!(credential = %credential, %err, "stream request refused");
            HttpResponse::NotFound().finish()
        }
    }
}

async fn stream_server_all(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    query: web::Query<StreamQuery>,
) -> HttpResponse {
    let credential = authorization(&req).map(Credential::SdkKey);
    respond_stream(
        &state,
        Audience::ServerSideAll,
        credential,
        query.filter_key(),
        &req,
    )
    .await
}

async fn stream_server_flags(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    query: web::Query<StreamQuery>,
) -> HttpResponse {
    let credential = authorization(&req).map(Credential::SdkKey);
    respond_stream(
        &state,
        Audience::ServerSideFlagsOnly,
        credential,
        query.filter_key(),
        &req,
    )
    .await
}

async fn stream_mobile(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    query: web::Query<StreamQuery>,
) -> HttpResponse {
    let credential = authorization(&req).map(Credential::MobileKey);
    respond_stream(
        &state,
        Audience::MobilePing,
        credential,
        query.filter_key(),
        &req,
    )
    .await
}

async fn stream_js_client(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    query: web::Query<StreamQuery>,
) -> HttpResponse {
    let credential = path_env_id(&req).map(Credential::EnvironmentId);
    respond_stream(
        &state,
        Audience::JsClientPing,
        credential,
        query.filter_key(),
        &req,
    )
    .await
}

async fn accept_for(
    state: &RelayEnvironments,
    credential: Option<Credential>,
    req: &HttpRequest,
    body: &web::Bytes,
) -> HttpResponse {
    let Some(credential) = credential else {
        return HttpResponse::Unauthorized().finish();
    };
    match state.events_relay(&credential) {
        Ok(relay) => ingestion::accept_events(&relay, req, body).await,
        Err(RelayError::Unauthorized) => HttpResponse::Unauthorized().finish(),
        Err(err) => {
            debug!(credential = %credential, %err, "event post refused");
            HttpResponse::NotFound().finish()
        }
    }
}

async fn post_server_events(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    body: web::Bytes,
) -> HttpResponse {
    let credential = authorization(&req).map(Credential::SdkKey);
    accept_for(&state, credential, &req, &body).await
}

async fn post_mobile_events(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    body: web::Bytes,
) -> HttpResponse {
    let credential = authorization(&req).map(Credential::MobileKey);
    accept_for(&state, credential, &req, &body).await
}

async fn post_js_client_events(
    req: HttpRequest,
    state: web::Data<RelayEnvironments>,
    body: web::Bytes,
) -> HttpResponse {
    let credential = path_env_id(&req).map(Credential::EnvironmentId);
    accept_for(&state, credential, &req, &body).await
}
