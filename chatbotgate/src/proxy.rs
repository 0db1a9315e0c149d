//!
//! The upstream forwarder and its hot-swap supervisor.
//!
//! Requests are streamed to the configured upstream with the usual
//! `X-Forwarded-*` set attached; response bodies stream back chunk by
//! chunk, which keeps server-sent events flowing. WebSocket upgrades are
//! carried by tunneling the two upgraded byte streams into each other.
//!

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::config::UpstreamConfig;

/// Headers that only make sense on a single hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Streams requests to one upstream root URL.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    base: Url,
    client: reqwest::Client,
    secret_header: Option<(HeaderName, HeaderValue)>,
}

impl UpstreamForwarder {
    pub fn new(config: &UpstreamConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_s))
            // Bodies may stream for as long as the upstream keeps talking.
            .pool_max_idle_per_host(8)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| format!("upstream http client: {e}"))?;

        let secret_header = match &config.secret_header {
            Some(secret) => {
                let name = HeaderName::try_from(secret.name.as_str())
                    .map_err(|_| format!("upstream.secret_header.name {:?} is invalid", secret.name))?;
                let value = HeaderValue::from_str(&secret.value)
                    .map_err(|_| "upstream.secret_header.value is not a valid header value".to_string())?;
                Some((name, value))
            }
            None => None,
        };

        Ok(Self {
            base: config.url.clone(),
            client,
            secret_header,
        })
    }

    /// Target URL for an incoming path + query.
    fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}{path}"));
        url.set_query(query);
        url
    }

    /// Forward one request. `headers` is the already-decorated header set
    /// (identity fields included); the body is streamed in both
    /// directions.
    pub async fn forward(&self, mut req: Request, headers: HeaderMap) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(|q| q.to_string());
        let url = self.target_url(&path, query.as_deref());

        let client_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.ip());
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string());

        let is_upgrade = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

        let mut outbound = self.outbound_headers(&headers, client_ip, host.as_deref());

        if is_upgrade {
            return self.forward_websocket(&mut req, url, outbound).await;
        }

        if let Some((name, value)) = &self.secret_header {
            outbound.insert(name.clone(), value.clone());
        }

        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
        let upstream = self
            .client
            .request(method, url.clone())
            .headers(outbound)
            .body(body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%url, %error, "upstream request failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if !HOP_BY_HOP.contains(&name.as_str()) {
                response_headers.insert(name.clone(), value.clone());
            }
        }

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    /// Shared header preparation: strip hop-by-hop, then stamp the
    /// forwarding set.
    fn outbound_headers(
        &self,
        headers: &HeaderMap,
        client_ip: Option<IpAddr>,
        host: Option<&str>,
    ) -> HeaderMap {
        let mut outbound = HeaderMap::new();
        for (name, value) in headers {
            if HOP_BY_HOP.contains(&name.as_str()) || *name == header::HOST {
                continue;
            }
            outbound.insert(name.clone(), value.clone());
        }

        if let Some(ip) = client_ip {
            let ip_text = ip.to_string();
            if let Ok(value) = HeaderValue::from_str(&ip_text) {
                outbound.insert("x-real-ip", value);
            }
            // X-Forwarded-For chains; we append ourselves to the record.
            let chained = match headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {ip_text}"),
                None => ip_text,
            };
            if let Ok(value) = HeaderValue::from_str(&chained) {
                outbound.insert("x-forwarded-for", value);
            }
        }

        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        if let Ok(value) = HeaderValue::from_str(proto) {
            outbound.insert("x-forwarded-proto", value);
        }

        if let Some(host) = host {
            if let Ok(value) = HeaderValue::from_str(host) {
                outbound.insert("x-forwarded-host", value);
            }
        }

        outbound
    }

    /// Tunnel a websocket: complete the handshake with the upstream,
    /// answer 101 to the client, then pump bytes both ways until either
    /// side hangs up.
    async fn forward_websocket(
        &self,
        req: &mut Request,
        url: Url,
        mut outbound: HeaderMap,
    ) -> Response {
        let Some(client_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>()
        else {
            return StatusCode::BAD_REQUEST.into_response();
        };

        // The upgrade negotiation headers must survive to the upstream.
        for name in ["sec-websocket-key", "sec-websocket-version", "sec-websocket-protocol", "sec-websocket-extensions"] {
            if let Some(value) = req.headers().get(name) {
                outbound.insert(HeaderName::try_from(name).expect("static header name"), value.clone());
            }
        }
        outbound.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        outbound.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        if let Some((name, value)) = &self.secret_header {
            outbound.insert(name.clone(), value.clone());
        }

        let upstream = match self
            .client
            .get(url.clone())
            .headers(outbound)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%url, %error, "websocket upstream request failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            let status = upstream.status();
            tracing::debug!(%url, %status, "upstream refused websocket upgrade");
            return status.into_response();
        }

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        for name in ["sec-websocket-accept", "sec-websocket-protocol", "sec-websocket-extensions"] {
            if let Some(value) = upstream.headers().get(name) {
                response.headers_mut().insert(
                    HeaderName::try_from(name).expect("static header name"),
                    value.clone(),
                );
            }
        }
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        response
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        tokio::spawn(async move {
            let upstream_io = match upstream.upgrade().await {
                Ok(io) => io,
                Err(error) => {
                    tracing::debug!(%error, "upstream websocket upgrade failed");
                    return;
                }
            };
            let client_io = match client_upgrade.await {
                Ok(io) => io,
                Err(error) => {
                    tracing::debug!(%error, "client websocket upgrade failed");
                    return;
                }
            };
            let mut client_io = hyper_util::rt::TokioIo::new(client_io);
            let mut upstream_io = upstream_io;
            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((up, down)) => {
                    tracing::debug!(bytes_up = up, bytes_down = down, "websocket tunnel closed")
                }
                Err(error) => tracing::debug!(%error, "websocket tunnel aborted"),
            }
        });

        response
    }
}

/// Owner of the atomically-published forwarder, hot-swapped alongside the
/// middleware when the upstream subset of the config changes.
#[derive(Debug)]
pub struct ProxySupervisor {
    current: ArcSwap<Option<UpstreamForwarder>>,
}

impl ProxySupervisor {
    pub fn new(config: Option<&UpstreamConfig>) -> Result<Self, String> {
        Ok(Self {
            current: ArcSwap::from_pointee(Self::build(config)?),
        })
    }

    fn build(config: Option<&UpstreamConfig>) -> Result<Option<UpstreamForwarder>, String> {
        config.map(UpstreamForwarder::new).transpose()
    }

    /// Atomically publish a forwarder for the new config. The previous
    /// forwarder keeps serving requests that already dereferenced it.
    pub fn replace(&self, config: Option<&UpstreamConfig>) -> Result<(), String> {
        let next = Self::build(config)?;
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// The forwarder snapshot for one request.
    pub fn forwarder(&self) -> Arc<Option<UpstreamForwarder>> {
        self.current.load_full()
    }
}
