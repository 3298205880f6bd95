use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use pingora::http::ResponseHeader;
use pingora::prelude::*;

use crate::configuration::Config;
use crate::error::Store;
use crate::limiter::{AUTHORIZATION_HEADER, Allowance, Denial, RateLimiter, extract_bearer};
use crate::metric::{MISSING_API_KEY, Metrics, UNKNOWN_API_KEY};

/// Per-request state carried from the rate limit check to the response.
#[derive(Default)]
pub struct GatewayCtx {
    api_key: Option<String>,
    allowance: Option<Allowance>,
}

/// Pingora proxy that gates every request through the rate limiter and
/// forwards admitted ones to the address lookup backends.
pub struct Gateway {
    config: Arc<RwLock<Config>>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(
        config: Arc<RwLock<Config>>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            limiter,
            metrics,
        }
    }

    async fn reject(&self, session: &mut Session, metric_key: &str, denial: &Denial) -> Result<bool> {
        let status = denial.status();
        self.metrics.record(metric_key, status);

        let mut header = ResponseHeader::build(status, None)?;
        match denial {
            Denial::MissingCredential | Denial::MalformedCredential => {
                header.insert_header("WWW-Authenticate", "Bearer")?;
            }
            Denial::QuotaExceeded { limit, retry_after } => {
                header.insert_header("Retry-After", retry_after_secs(*retry_after).to_string())?;
                header.insert_header("X-RateLimit-Limit", limit.to_string())?;
                header.insert_header("X-RateLimit-Remaining", "0")?;
            }
            Denial::KeyNotFound | Denial::KeyInactive | Denial::StoreUnavailable { .. } => {}
        }
        header.insert_header("Content-Length", "0")?;
        session.set_keepalive(None);
        session
            .write_response_header(Box::new(header), true)
            .await?;
        Ok(true)
    }
}

/// Metrics bucket for a denied, well-formed credential. Only keys the
/// directory has vouched for get their own bucket.
fn denial_metric_key<'a>(api_key: &'a str, denial: &Denial) -> &'a str {
    match denial {
        Denial::KeyNotFound
        | Denial::StoreUnavailable {
            store: Store::PlanDirectory,
            ..
        } => UNKNOWN_API_KEY,
        _ => api_key,
    }
}

/// Whole seconds, rounded up, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl ProxyHttp for Gateway {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let authorization = session
            .req_header()
            .headers
            .get(AUTHORIZATION_HEADER)
            .map(|v| v.to_str().map(str::to_owned));
        let authorization = match authorization {
            None => None,
            Some(Ok(value)) => Some(value),
            Some(Err(_)) => {
                return self
                    .reject(session, MISSING_API_KEY, &Denial::MalformedCredential)
                    .await;
            }
        };

        let api_key = match extract_bearer(authorization.as_deref()) {
            Ok(key) => key.to_owned(),
            Err(denial) => return self.reject(session, MISSING_API_KEY, &denial).await,
        };

        match self.limiter.check_credential(&api_key).await {
            Ok(allowance) => {
                ctx.api_key = Some(api_key);
                ctx.allowance = Some(allowance);
                Ok(false)
            }
            Err(denial) => {
                let metric_key = denial_metric_key(&api_key, &denial);
                self.reject(session, metric_key, &denial).await
            }
        }
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        if let Some(allowance) = ctx.allowance.as_ref() {
            upstream_response.insert_header("X-RateLimit-Limit", allowance.limit.to_string())?;
            upstream_response
                .insert_header("X-RateLimit-Remaining", allowance.remaining.to_string())?;
        }
        if let Some(api_key) = ctx.api_key.as_ref() {
            self.metrics
                .record(api_key, upstream_response.status.as_u16());
        }
        Ok(())
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let path = session.req_header().uri.path();

        let config = self.config.read().map_err(|_| {
            Error::explain(ErrorType::InternalError, "backend config lock poisoned")
        })?;

        let route = config.route(path).ok_or_else(|| {
            Error::explain(ErrorType::HTTPStatus(404), "no backend for path")
        })?;

        Ok(Box::new(HttpPeer::new(
            route.backend.addr(),
            false, // plain HTTP to the upstream
            String::new(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::StoreError;

    #[test]
    fn unvetted_keys_share_one_metrics_bucket() {
        let directory_down = Denial::StoreUnavailable {
            store: Store::PlanDirectory,
            source: StoreError::Timeout(Duration::from_millis(250)),
        };
        assert_eq!(denial_metric_key("junk-1", &directory_down), UNKNOWN_API_KEY);
        assert_eq!(denial_metric_key("junk-2", &Denial::KeyNotFound), UNKNOWN_API_KEY);

        let counters_down = Denial::StoreUnavailable {
            store: Store::UsageCounter,
            source: StoreError::Timeout(Duration::from_millis(250)),
        };
        assert_eq!(denial_metric_key("addr_k", &counters_down), "addr_k");
        assert_eq!(denial_metric_key("addr_k", &Denial::KeyInactive), "addr_k");
        let exceeded = Denial::QuotaExceeded {
            limit: 3,
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(denial_metric_key("addr_k", &exceeded), "addr_k");
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(30)), 30);
        assert_eq!(retry_after_secs(Duration::from_millis(30_001)), 31);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
