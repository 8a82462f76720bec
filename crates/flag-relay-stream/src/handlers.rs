//! actix-web glue for the SSE streaming endpoints.
//!
//! A [`StreamHandler`] is what a broadcast hub hands back for a matching
//! credential: it owns the subscription handshake (replay, then live
//! frames) and renders the response with the headers SSE clients and
//! reverse proxies need.

use std::convert::Infallible;

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use flag_relay_core::credential::ScopedCredential;
use flag_relay_core::error::RelayError;

use crate::broadcast::StreamBroadcaster;

/// An HTTP handler bound to one hub and one scoped credential.
pub struct StreamHandler {
    hub: std::sync::Arc<StreamBroadcaster>,
    scoped: ScopedCredential,
}

impl StreamHandler {
    pub(crate) fn new(hub: std::sync::Arc<StreamBroadcaster>, scoped: ScopedCredential) -> Self {
        Self { hub, scoped }
    }

    /// Open the SSE response: replay events first, then live frames until
    /// the client disconnects, the hub closes, or `max_conn_time` elapses.
    pub async fn respond(&self, req: &HttpRequest) -> HttpResponse {
        let receiver = match self.hub.subscribe(&self.scoped).await {
            Ok(receiver) => receiver,
            Err(RelayError::Shutdown) => return HttpResponse::ServiceUnavailable().finish(),
            Err(err) => {
                debug!(%err, "stream subscription refused");
                return HttpResponse::NotFound().finish();
            }
        };
        let frames = ReceiverStream::new(receiver)
            .map(|frame| Ok::<Bytes, Infallible>(frame.encode()));

        let options = self.hub.options();
        let mut builder = HttpResponse::Ok();
        builder
            .insert_header((header::CONTENT_TYPE, "text/event-stream"))
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            // Reverse proxies must not buffer the event stream.
            .insert_header(("X-Accel-Buffering", "no"));

        if options.allow_cors {
            let origin = req
                .headers()
                .get(header::ORIGIN)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("*")
                .to_string();
            builder
                .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, origin))
                .insert_header((
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    format!("{}, OPTIONS", req.method()),
                ))
                .insert_header((
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    "Cache-Control, Content-Type, Authorization",
                ));
        }

        match options.max_conn_time {
            Some(max) => {
                // Force long-lived subscribers to reconnect so load
                // rebalances across relay replicas.
                builder.streaming(frames.take_until(Box::pin(tokio::time::sleep(max))))
            }
            None => builder.streaming(frames),
        }
    }
}
