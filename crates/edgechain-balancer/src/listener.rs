//! Listeners, their actions, and the listener lifecycle.

use edgechain_core::Protocol;
use edgechain_state::TargetHealthState;
use http::{Request, Response, StatusCode, header};
use serde::{Deserialize, Serialize};

use crate::certificate::CertificateRef;

/// Lifecycle of a listener.
///
/// `Created` until the balancer is active, `Listening` once it accepts
/// connections, then driven by the health of the targets behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Created,
    Listening,
    Healthy,
    /// Some, but not all, targets are healthy.
    Degraded,
    Unhealthy,
}

impl ListenerState {
    /// Aggregate target health into a listener state. Listeners with no
    /// targets, or none decided yet, stay `Listening`.
    pub fn from_targets(states: &[TargetHealthState]) -> Self {
        let healthy = states.iter().filter(|s| **s == TargetHealthState::Healthy).count();
        let unhealthy = states.iter().filter(|s| **s == TargetHealthState::Unhealthy).count();
        if healthy == 0 && unhealthy == 0 {
            ListenerState::Listening
        } else if healthy == states.len() {
            ListenerState::Healthy
        } else if healthy > 0 {
            ListenerState::Degraded
        } else {
            ListenerState::Unhealthy
        }
    }

    pub fn is_serving(self) -> bool {
        matches!(self, ListenerState::Healthy | ListenerState::Degraded)
    }
}

/// Permanent redirect to another protocol/port, keeping host, path and query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectAction {
    pub protocol: Protocol,
    pub port: u16,
    pub status: u16,
}

impl RedirectAction {
    pub fn to_https(port: u16) -> Self {
        Self {
            protocol: Protocol::Https,
            port,
            status: StatusCode::MOVED_PERMANENTLY.as_u16(),
        }
    }

    /// Build the redirect for `request`. The body and method are ignored.
    pub fn apply<B>(&self, request: &Request<B>) -> Response<()> {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().host())
            .unwrap_or_default();
        // Drop any port the client used; the redirect names its own.
        let host = strip_port(host);
        let scheme = match self.protocol {
            Protocol::Http => "http",
            _ => "https",
        };
        let default_port = if scheme == "https" { 443 } else { 80 };
        let authority = if self.port == default_port {
            host.to_string()
        } else {
            format!("{host}:{}", self.port)
        };
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("{scheme}://{authority}{path}");

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::MOVED_PERMANENTLY);
        let mut response = Response::new(());
        *response.status_mut() = status;
        if let Ok(value) = header::HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
        response
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split_once(':').map(|(h, _)| h).unwrap_or(host)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerAction {
    Redirect(RedirectAction),
    Forward { target_group: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub balancer: String,
    pub protocol: Protocol,
    pub port: u16,
    /// Set on TLS listeners only; exactly one.
    pub certificate: Option<CertificateRef>,
    pub action: ListenerAction,
    pub state: ListenerState,
}

impl Listener {
    pub fn handle(&self, dns_name: &str) -> ListenerHandle {
        ListenerHandle {
            listener: self.id.clone(),
            balancer: self.balancer.clone(),
            dns_name: dns_name.to_string(),
            protocol: self.protocol,
            port: self.port,
        }
    }

    pub fn target_group(&self) -> Option<&str> {
        match &self.action {
            ListenerAction::Forward { target_group } => Some(target_group),
            ListenerAction::Redirect(_) => None,
        }
    }
}

/// Read-only reference to a listener on another balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerHandle {
    pub listener: String,
    pub balancer: String,
    pub dns_name: String,
    pub protocol: Protocol,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::get(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(()).unwrap()
    }

    fn location(response: &Response<()>) -> &str {
        response.headers()[header::LOCATION].to_str().unwrap()
    }

    #[test]
    fn redirect_keeps_host_path_and_query() {
        let redirect = RedirectAction::to_https(443);
        let response = redirect.apply(&get("/chat/42?lang=fr", Some("app.internal:80")));

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location(&response), "https://app.internal/chat/42?lang=fr");
    }

    #[test]
    fn redirect_is_content_free_and_uniform() {
        let redirect = RedirectAction::to_https(443);
        for (uri, host) in [("/", "a.example"), ("/x/y", "b.example"), ("/?q=1", "c.example")] {
            let response = redirect.apply(&get(uri, Some(host)));
            assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
            assert!(location(&response).starts_with(&format!("https://{host}/")));
        }
    }

    #[test]
    fn redirect_uses_absolute_uri_host() {
        let redirect = RedirectAction::to_https(443);
        let response = redirect.apply(&get("http://app.internal/health", None));
        assert_eq!(location(&response), "https://app.internal/health");
    }

    #[test]
    fn redirect_names_non_default_port() {
        let redirect = RedirectAction::to_https(8443);
        let response = redirect.apply(&get("/", Some("app.internal")));
        assert_eq!(location(&response), "https://app.internal:8443/");
    }

    #[test]
    fn listener_state_aggregation() {
        use TargetHealthState::*;
        assert_eq!(ListenerState::from_targets(&[]), ListenerState::Listening);
        assert_eq!(ListenerState::from_targets(&[Initial, Initial]), ListenerState::Listening);
        assert_eq!(ListenerState::from_targets(&[Healthy, Healthy]), ListenerState::Healthy);
        assert_eq!(ListenerState::from_targets(&[Healthy, Unhealthy]), ListenerState::Degraded);
        assert_eq!(ListenerState::from_targets(&[Healthy, Initial]), ListenerState::Degraded);
        assert_eq!(ListenerState::from_targets(&[Unhealthy, Initial]), ListenerState::Unhealthy);
    }
}
