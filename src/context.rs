//! Request context consumed by the built-in key strategies.
//!
//! The engine treats the context as opaque; only the strategies read the
//! client address, the principal and request parameters through
//! [`RequestContext`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{trace, warn};

use crate::config::RatelimitSettings;
use crate::error::{RatelimitError, Result};
use crate::ratelimit::EpochTracker;

static FORWARDED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)for="?([^";, ]+)"#).expect("forwarded pattern is a valid regex")
});
static X_FORWARDED_FOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[ "]*([^";, ]+)"#).expect("x-forwarded-for pattern is a valid regex")
});

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable identifier (primary key)
    pub id: String,
    /// Staff or superuser
    pub privileged: bool,
}

impl Principal {
    /// A regular user.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privileged: false,
        }
    }

    /// A privileged user.
    pub fn privileged(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privileged: true,
        }
    }
}

/// Read access to the request being rate limited.
pub trait RequestContext: Send + Sync {
    /// Upper-case HTTP method.
    fn method(&self) -> &str;

    /// Peer address as reported by the server, if any.
    fn remote_addr(&self) -> Option<&str>;

    /// CGI-style meta variable, e.g. `HTTP_X_FORWARDED_FOR`.
    fn meta(&self, name: &str) -> Option<&str>;

    /// The authenticated principal.
    fn principal(&self) -> Option<&Principal>;

    /// Session identifier.
    fn session_key(&self) -> Option<&str> {
        None
    }

    /// Value stored in the session under `name`.
    fn session_value(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Query string parameter.
    fn query_param(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Form body parameter.
    fn form_param(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Epoch tracker scoped to this request, used when no explicit epoch is
    /// given.
    fn epoch(&self) -> Option<&EpochTracker> {
        None
    }
}

/// Plain owned request, mostly for tests and the command line.
#[derive(Debug, Default)]
pub struct SimpleRequest {
    method: String,
    remote_addr: Option<String>,
    meta: HashMap<String, String>,
    principal: Option<Principal>,
    session_key: Option<String>,
    session: HashMap<String, String>,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    epoch: EpochTracker,
}

impl SimpleRequest {
    /// Create a request with the given method.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    /// Set the peer address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Set a meta variable.
    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(name.into(), value.into());
        self
    }

    /// Authenticate the request.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Set the session identifier.
    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    /// Store a session value.
    pub fn with_session_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.session.insert(name.into(), value.into());
        self
    }

    /// Set a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set a form parameter.
    pub fn with_form(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }
}

impl RequestContext for SimpleRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    fn meta(&self, name: &str) -> Option<&str> {
        self.meta.get(name).map(String::as_str)
    }

    fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    fn session_value(&self, name: &str) -> Option<&str> {
        self.session.get(name).map(String::as_str)
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    fn form_param(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    fn epoch(&self) -> Option<&EpochTracker> {
        Some(&self.epoch)
    }
}

/// Resolve the client address, honoring forwarding headers from trusted
/// proxies only.
pub fn client_ip(context: &dyn RequestContext, settings: &RatelimitSettings) -> Result<IpAddr> {
    let mut client = context
        .remote_addr()
        .filter(|addr| !addr.is_empty())
        .unwrap_or("unix")
        .to_string();

    if settings.trusted_proxies().contains(&client) {
        let forwarded = context
            .meta("HTTP_FORWARDED")
            .and_then(|v| FORWARDED_RE.captures(v))
            .or_else(|| {
                context
                    .meta("HTTP_X_FORWARDED_FOR")
                    .and_then(|v| X_FORWARDED_FOR_RE.captures(v))
            });
        if let Some(caps) = forwarded {
            trace!(proxy = %client, forwarded = &caps[1], "Using forwarded client address");
            client = caps[1].to_string();
        }
    }

    if client == "testclient" {
        client = settings.testclient_fallback.clone();
    }
    if client == "unix" || client == "invalid" {
        return Err(RatelimitError::InvalidAddress(format!(
            "could not determine ip address from {:?}",
            client
        )));
    }

    let host = strip_port(&client);
    host.parse().map_err(|_| {
        warn!(address = %client, "Unparsable client address");
        RatelimitError::InvalidAddress(client.clone())
    })
}

fn strip_port(addr: &str) -> &str {
    if addr.contains('.') && addr.matches(':').count() <= 1 {
        // ipv4, optionally with port
        return addr.split(':').next().unwrap_or(addr);
    }
    if let Some(rest) = addr.strip_prefix('[') {
        // [ipv6] or [ipv6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    addr
}
