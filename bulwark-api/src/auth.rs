//! The request pipeline: audit, timeout, metrics, proxy unwrap, URL
//! normalization, enclave lookup and authorization — composed in that
//! order around every handler.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bulwark_keystore::{AuditRecord, AuditRequest, Identity};
use percent_encoding::percent_decode_str;
use std::time::{Duration, Instant};

use crate::error::ApiError;
use crate::routes::Shared;
use crate::tls::identity_from_cert_der;

/// Hard deadline for every route except the audit trace stream.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Header selecting a non-default enclave.
pub const ENCLAVE_HEADER: &str = "X-Bulwark-Enclave";

/// Per-connection facts, injected by the TLS accept loop.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    pub remote: std::net::SocketAddr,
    pub identity: Identity,
}

/// The request's effective identity after proxy unwrapping.
#[derive(Clone, Debug)]
pub struct EffectiveIdentity(pub Identity);

/// Routes reachable without a client certificate or policy.
fn is_public(path: &str) -> bool {
    matches!(path, "/version" | "/metrics")
}

fn timeout_for(path: &str) -> Option<Duration> {
    if path == "/v1/log/audit/trace" {
        None
    } else {
        Some(DEFAULT_TIMEOUT)
    }
}

// ---------------------------------------------------------------------------
// Pipeline middleware
// ---------------------------------------------------------------------------

pub async fn pipeline(State(state): State<Shared>, mut req: Request, next: Next) -> Response {
    let start = Instant::now();
    let path = req.uri().path().to_string();

    let conn = match req.extensions().get::<ConnInfo>() {
        Some(conn) => conn.clone(),
        // Only reachable when the router is driven without the TLS accept
        // loop, i.e. in tests.
        None => ConnInfo {
            remote: ([0, 0, 0, 0], 0).into(),
            identity: Identity::unknown(),
        },
    };

    let mut identity = conn.identity.clone();
    let enclave = state.enclave_for(req.headers());

    let response = 'handled: {
        // URL normalization comes before anything path-driven.
        if let Err(e) = normalize_path(&path) {
            break 'handled e.into_response();
        }

        let enclave = match &enclave {
            Some(enclave) => enclave.clone(),
            None => {
                break 'handled ApiError::bad_request("unknown enclave").into_response();
            }
        };

        // A trusted proxy forwards the real client certificate in a header;
        // the effective identity is re-derived from it.
        if state.proxy.is_proxy(&identity) {
            identity = match unwrap_proxied_identity(req.headers(), &state.proxy.cert_header) {
                Ok(id) => id,
                Err(e) => break 'handled e.into_response(),
            };
        }

        req.extensions_mut().insert(EffectiveIdentity(identity.clone()));
        req.extensions_mut().insert(enclave.clone());

        if !is_public(&path) {
            if let Err(e) = enclave.verify_request(&identity, &path) {
                break 'handled ApiError::from(e).into_response();
            }
        }

        match timeout_for(&path) {
            Some(deadline) => match tokio::time::timeout(deadline, next.run(req)).await {
                Ok(response) => response,
                Err(_) => ApiError::unavailable("request timed out").into_response(),
            },
            None => next.run(req).await,
        }
    };

    let latency = start.elapsed();
    state.metrics.observe(response.status(), latency);

    if state.log_error && response.status().is_server_error() {
        tracing::error!(path = %path, status = response.status().as_u16(), "request failed");
    }

    // Exactly one audit record per request, whatever the outcome.
    let audit_target = enclave.as_deref().unwrap_or(state.default_enclave.as_ref());
    audit_target.audit().record(AuditRecord::new(
        AuditRequest {
            ip: Some(conn.remote.ip().to_string()),
            path,
            identity,
            enclave: audit_target.name().to_string(),
        },
        response.status().as_u16(),
        latency,
    ));

    response
}

// ---------------------------------------------------------------------------
// URL normalization
// ---------------------------------------------------------------------------

/// Reject `.` and `..` segments and empty interior segments (`//`).
/// A single trailing slash is legal and significant.
pub fn normalize_path(path: &str) -> Result<(), ApiError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(ApiError::bad_request("path must be absolute"));
    };
    let segments: Vec<&str> = rest.split('/').collect();
    for (index, segment) in segments.iter().enumerate() {
        if *segment == "." || *segment == ".." {
            return Err(ApiError::bad_request("path escapes route prefix"));
        }
        if segment.is_empty() && index + 1 != segments.len() {
            return Err(ApiError::bad_request("path contains empty segment"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Proxy unwrapping
// ---------------------------------------------------------------------------

/// Decode the forwarded certificate header: URL-encoded PEM, from which the
/// effective identity is re-derived.
fn unwrap_proxied_identity(headers: &HeaderMap, header: &str) -> Result<Identity, ApiError> {
    let value = headers
        .get(header)
        .ok_or_else(|| ApiError::bad_request("missing forwarded client certificate"))?;
    let raw = value
        .to_str()
        .map_err(|_| ApiError::bad_request("malformed forwarded client certificate"))?;
    let pem_text = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ApiError::bad_request("malformed forwarded client certificate"))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_text.as_bytes())
        .map_err(|_| ApiError::bad_request("malformed forwarded client certificate"))?;
    identity_from_cert_der(&pem.contents)
        .ok_or_else(|| ApiError::bad_request("malformed forwarded client certificate"))
}

// ---------------------------------------------------------------------------
// Proxy settings
// ---------------------------------------------------------------------------

/// The set of TLS peers trusted to forward client certificates.
pub struct ProxySettings {
    pub identities: Vec<Identity>,
    pub cert_header: String,
}

impl ProxySettings {
    pub fn is_proxy(&self, identity: &Identity) -> bool {
        !identity.is_unknown() && self.identities.contains(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rejects_dot_segments() {
        assert!(normalize_path("/v1/key/create/k").is_ok());
        assert!(normalize_path("/v1/key/list/").is_ok());
        assert!(normalize_path("/v1/../admin").is_err());
        assert!(normalize_path("/v1/./key").is_err());
        assert!(normalize_path("/v1//key").is_err());
        assert!(normalize_path("/v1/key//").is_err());
        assert!(normalize_path("v1/key").is_err());
    }

    #[test]
    fn proxy_membership_ignores_unknown() {
        let proxy = ProxySettings {
            identities: vec![Identity::unknown()],
            cert_header: "X-Tls-Client-Cert".into(),
        };
        // Even a misconfigured proxy list never trusts "unknown".
        assert!(!proxy.is_proxy(&Identity::unknown()));
    }

    #[test]
    fn missing_proxy_header_is_a_bad_request() {
        let headers = HeaderMap::new();
        let err = unwrap_proxied_identity(&headers, "X-Tls-Client-Cert").unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn garbage_proxy_header_is_a_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Tls-Client-Cert", "%2D%2D%2Dnot-a-cert".parse().unwrap());
        let err = unwrap_proxied_identity(&headers, "X-Tls-Client-Cert").unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
