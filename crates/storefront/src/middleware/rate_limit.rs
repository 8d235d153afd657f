//! Per-client rate limiting for the public API using governor and
//! `tower_governor`.
//!
//! The payment webhook is deliberately outside this layer: the processor
//! retries on 429 and would turn throttling into redelivery storms.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::Request;
use governor::clock::QuantaInstant;
use governor::middleware::NoOpMiddleware;
use tower_governor::{GovernorError, GovernorLayer, governor::GovernorConfigBuilder};

/// Replenish one token every second.
const REPLENISH_SECONDS: u64 = 1;
/// Requests a client may make in a burst.
const BURST_SIZE: u32 = 30;

// =============================================================================
// Client IP Key Extractor
// =============================================================================

/// Key extractor that trusts the edge proxy's client IP headers, then falls
/// back to the socket peer address.
#[derive(Debug, Clone, Copy)]
pub struct ClientIpKeyExtractor;

fn header_ip<T>(req: &Request<T>, name: &str) -> Option<IpAddr> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

impl tower_governor::key_extractor::KeyExtractor for ClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        header_ip(req, "cf-connecting-ip")
            .or_else(|| header_ip(req, "x-forwarded-for"))
            .or_else(|| header_ip(req, "x-real-ip"))
            .or_else(|| {
                req.extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip())
            })
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

// =============================================================================
// Rate Limiter Configuration
// =============================================================================

/// Rate limiter layer type for Axum.
pub type RateLimiterLayer =
    GovernorLayer<ClientIpKeyExtractor, NoOpMiddleware<QuantaInstant>, axum::body::Body>;

/// Create the rate limiter for public endpoints: ~60 requests per minute per
/// IP with a burst of 30.
///
/// Returns `None` if governor rejects the quota.
#[must_use]
pub fn public_rate_limiter() -> Option<RateLimiterLayer> {
    let config = GovernorConfigBuilder::default()
        .key_extractor(ClientIpKeyExtractor)
        .per_second(REPLENISH_SECONDS)
        .burst_size(BURST_SIZE)
        .finish()?;
    Some(GovernorLayer::new(Arc::new(config)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tower_governor::key_extractor::KeyExtractor;

    use super::*;

    #[test]
    fn test_prefers_edge_header() {
        let req = Request::builder()
            .header("cf-connecting-ip", "203.0.113.7")
            .header("x-forwarded-for", "198.51.100.1, 10.0.0.1")
            .body(())
            .unwrap();
        let ip = ClientIpKeyExtractor.extract(&req).unwrap();
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_forwarded_for_uses_first_hop() {
        let req = Request::builder()
            .header("x-forwarded-for", "198.51.100.1, 10.0.0.1")
            .body(())
            .unwrap();
        let ip = ClientIpKeyExtractor.extract(&req).unwrap();
        assert_eq!(ip, "198.51.100.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_falls_back_to_peer_address() {
        let mut req = Request::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("192.0.2.4:5555".parse::<SocketAddr>().unwrap()));
        let ip = ClientIpKeyExtractor.extract(&req).unwrap();
        assert_eq!(ip, "192.0.2.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_no_source_is_an_error() {
        let req = Request::builder().body(()).unwrap();
        assert!(ClientIpKeyExtractor.extract(&req).is_err());
    }

    #[test]
    fn test_public_limiter_builds() {
        assert!(public_rate_limiter().is_some());
    }
}
