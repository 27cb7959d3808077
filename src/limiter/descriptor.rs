//! Request descriptors.

use std::net::IpAddr;

/// The facts about one inbound request that the engine partitions quotas by.
///
/// Built once per request by the caller (typically HTTP middleware) and
/// owned by it for the duration of the check. The engine needs no identity
/// beyond these fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Source IP address of the request.
    pub ip: IpAddr,
    /// Authenticated API client identifier, when known.
    pub client_id: Option<String>,
    /// Organization / tenant identifier, when known.
    pub organization_id: Option<String>,
    /// Request path, e.g. `/api/events`.
    pub path: String,
    /// HTTP method, e.g. `GET`.
    pub method: String,
}

impl RequestDescriptor {
    /// Create a descriptor for an anonymous request.
    pub fn new(ip: IpAddr, path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            ip,
            client_id: None,
            organization_id: None,
            path: path.into(),
            method: method.into(),
        }
    }

    /// Attach an API client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Attach an organization identifier.
    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// The identity used for per-origin telemetry: the client id when the
    /// request is authenticated, the IP address otherwise.
    pub fn origin(&self) -> String {
        match self.client_id.as_deref() {
            Some(client) if !client.is_empty() => client.to_string(),
            _ => self.ip.to_string(),
        }
    }
}
