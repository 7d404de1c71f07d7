//! # ACME HTTP-01 Challenge Store
//!
//! Holds the challenge tuple the ACME client is currently validating and
//! answers the well-known challenge path on the front. The tuple is only
//! populated between `present` and the matching `cleanup`; outside that
//! window the responder returns 404. ACME validations are serialized by the
//! client library, so a single mutex is all the coordination this needs.

use std::sync::Mutex;

use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;

/// Prefix of the ACME HTTP-01 well-known path.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
struct ChallengeTuple {
    domain: String,
    token: String,
    key_auth: String,
}

/// The currently active HTTP-01 challenge, if any.
#[derive(Default)]
pub struct ChallengeStore {
    active: Mutex<Option<ChallengeTuple>>,
}

impl ChallengeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the challenge tuple, overwriting any prior one.
    pub fn present(&self, domain: &str, token: &str, key_auth: &str) {
        tracing::info!(domain, "acme challenge presented");
        *self.active.lock().expect("challenge lock poisoned") = Some(ChallengeTuple {
            domain: domain.to_string(),
            token: token.to_string(),
            key_auth: key_auth.to_string(),
        });
    }

    /// Clears the tuple unconditionally.
    pub fn cleanup(&self, domain: &str, _token: &str, _key_auth: &str) {
        tracing::info!(domain, "acme challenge cleaned up");
        *self.active.lock().expect("challenge lock poisoned") = None;
    }

    /// Answers a request that hit the well-known challenge path.
    ///
    /// With no active tuple every request is 404. With one active, a GET for
    /// the stored token on a host starting with the stored domain gets the
    /// key authorization as `text/plain`; anything else gets a generic 200
    /// diagnostic body so a probing validator still sees a live endpoint.
    pub fn serve(&self, host: &str, method: &Method, path: &str) -> Response {
        let guard = self.active.lock().expect("challenge lock poisoned");
        match &*guard {
            None => {
                tracing::info!(host, %method, "challenge request after end");
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .unwrap()
            }
            Some(tuple)
                if host.starts_with(&tuple.domain)
                    && method == Method::GET
                    && path == format!("{CHALLENGE_PATH_PREFIX}{}", tuple.token) =>
            {
                tracing::info!(domain = %tuple.domain, "served key authentication");
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from(tuple.key_auth.clone()))
                    .unwrap()
            }
            Some(_) => {
                tracing::info!(host, %method, "challenge request did not match");
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("TEST"))
                    .unwrap()
            }
        }
    }
}
