use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use sha2::{Digest, Sha256};
use tower_governor::{errors::GovernorError, key_extractor::KeyExtractor};

use crate::error::AppError;
use crate::middlewares::auth::session_token;
use crate::services::validation::Email;
use crate::state::AppState;

pub type SessionRateLimiter = DefaultKeyedRateLimiter<String>;

pub fn session_rate_limiter(per_minute: u32) -> SessionRateLimiter {
    let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
    RateLimiter::keyed(quota)
}

/// Keys requests by session token, falling back to the client address.
///
/// The client address is the TCP peer unless the service runs behind a
/// proxy it trusts, in which case it is the hop that proxy appended to
/// `X-Forwarded-For`.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SessionKeyExtractor {
    pub trust_forwarded_for: bool,
}

// Only the right-most entry was written by our proxy
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .last()
        .and_then(|value| value.rsplit(',').next())
        .and_then(|hop| hop.trim().parse().ok())
}

impl SessionKeyExtractor {
    fn client_ip<B>(&self, req: &Request<B>) -> Option<IpAddr> {
        if self.trust_forwarded_for {
            if let Some(ip) = forwarded_for(req.headers()) {
                return Some(ip);
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    }
}

impl KeyExtractor for SessionKeyExtractor {
    type Key = String;

    fn extract<B>(&self, req: &Request<B>) -> Result<Self::Key, GovernorError> {
        if let Some(token) = session_token(req.headers()) {
            // Tokens never end up in limiter memory as plain text
            let digest = Sha256::digest(token.as_bytes());
            return Ok(format!("session:{}", hex::encode(digest)));
        }
        self.client_ip(req)
            .map(|ip| format!("ip:{ip}"))
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

fn enforce(limiter: &SessionRateLimiter, key: String) -> Result<(), AppError> {
    limiter.check_key(&key).map_err(|_| AppError::RateLimited)
}

/// Limits an unauthenticated action per target email, on top of the per-client limit.
pub fn limit_email(state: &AppState, action: &str, email: &Email) -> Result<(), AppError> {
    let key = format!("{action}:{}", email.as_str().to_ascii_lowercase());
    enforce(&state.limiter, key).inspect_err(|_| {
        tracing::warn!(action, "rate limit exceeded for email");
    })
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let extractor = SessionKeyExtractor {
        trust_forwarded_for: state.config.trust_forwarded_for,
    };
    match extractor.extract(&request) {
        Ok(key) => {
            if enforce(&state.limiter, key).is_err() {
                tracing::warn!(path = %request.uri().path(), "rate limit exceeded");
                return Err(AppError::RateLimited);
            }
        }
        Err(_) => {
            tracing::warn!(path = %request.uri().path(), "no client address, request not rate limited");
        }
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    const DIRECT: SessionKeyExtractor = SessionKeyExtractor {
        trust_forwarded_for: false,
    };
    const PROXIED: SessionKeyExtractor = SessionKeyExtractor {
        trust_forwarded_for: true,
    };

    fn from_peer(builder: axum::http::request::Builder, peer: &str) -> Request<Body> {
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        req
    }

    #[test]
    fn keys_prefer_session_over_address() {
        let req = from_peer(
            Request::builder().header("authorization", "Bearer abc"),
            "192.0.2.7:5000",
        );
        assert!(DIRECT.extract(&req).unwrap().starts_with("session:"));

        let req = from_peer(Request::builder(), "192.0.2.7:5000");
        assert_eq!(DIRECT.extract(&req).unwrap(), "ip:192.0.2.7");

        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(DIRECT.extract(&req).is_err());
    }

    #[test]
    fn forwarded_for_is_ignored_without_a_trusted_proxy() {
        let req = from_peer(
            Request::builder().header("x-forwarded-for", "10.0.0.1"),
            "192.0.2.7:5000",
        );
        assert_eq!(DIRECT.extract(&req).unwrap(), "ip:192.0.2.7");
    }

    #[test]
    fn trusted_proxy_hop_is_the_right_most_entry() {
        // The client controls everything left of the proxy's own entry
        let req = from_peer(
            Request::builder().header("x-forwarded-for", "1.2.3.4, 10.0.0.2"),
            "192.0.2.7:5000",
        );
        assert_eq!(PROXIED.extract(&req).unwrap(), "ip:10.0.0.2");

        let req = from_peer(
            Request::builder().header("x-forwarded-for", "not-an-ip"),
            "192.0.2.7:5000",
        );
        assert_eq!(PROXIED.extract(&req).unwrap(), "ip:192.0.2.7");
    }

    #[test]
    fn limiter_enforces_quota_per_key() {
        let limiter = session_rate_limiter(2);
        let a = "ip:192.0.2.1".to_string();
        let b = "ip:192.0.2.2".to_string();
        assert!(enforce(&limiter, a.clone()).is_ok());
        assert!(enforce(&limiter, a.clone()).is_ok());
        assert!(matches!(enforce(&limiter, a), Err(AppError::RateLimited)));
        assert!(enforce(&limiter, b).is_ok());
    }
}
