//! The remote party as seen by the host.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claims::{Claims, Role};
use crate::context::CapturingContext;

/// How the viewer's connection was authenticated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuthenticationType {
    /// Loopback connection, trusted by the host.
    Localhost,
    /// Bearer token validated by the transport.
    BearerToken,
}

/// A connected viewer together with its owned capturing context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Viewer {
    /// Unique connection identity assigned by the transport.
    pub connection_id: String,
    pub capturing_context: CapturingContext,
    pub user_name: String,
    pub role: Role,
    pub claims: Claims,
    pub connected_time: DateTime<Utc>,
    pub ip_address: Option<IpAddr>,
    pub authentication_type: AuthenticationType,
}

impl Viewer {
    /// Create a viewer with the role's default claims and a fresh context.
    pub fn new(
        connection_id: impl Into<String>,
        user_name: impl Into<String>,
        role: Role,
        authentication_type: AuthenticationType,
    ) -> Self {
        let connection_id = connection_id.into();
        Self {
            capturing_context: CapturingContext::new(connection_id.clone()),
            connection_id,
            user_name: user_name.into(),
            role,
            claims: role.default_claims(),
            connected_time: Utc::now(),
            ip_address: None,
            authentication_type,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_claims(mut self, claims: Claims) -> Self {
        self.claims = claims;
        self
    }

    pub fn with_context(mut self, context: CapturingContext) -> Self {
        self.capturing_context = context;
        self.capturing_context.viewer_id = self.connection_id.clone();
        self
    }

    pub fn has_claim(&self, claim: Claims) -> bool {
        self.claims.contains(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_bound_to_the_viewer() {
        let ctx = CapturingContext::new("someone-else");
        let viewer = Viewer::new("conn-1", "alice", Role::Operator, AuthenticationType::BearerToken)
            .with_context(ctx);
        assert_eq!(viewer.capturing_context.viewer_id, "conn-1");
    }

    #[test]
    fn claims_follow_role_unless_overridden() {
        let viewer = Viewer::new("c", "bob", Role::Observer, AuthenticationType::Localhost);
        assert!(!viewer.has_claim(Claims::MOUSE_INPUT));
        let viewer = viewer.with_claims(Claims::MOUSE_INPUT);
        assert!(viewer.has_claim(Claims::MOUSE_INPUT));
    }
}
