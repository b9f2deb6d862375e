//! Connection capability resolution.
//!
//! The gateway link carries two independent roles: the operator role (chat
//! send/history/abort) and the node role (gateway-invoked device
//! capabilities). This module maps the raw dual-role status into a tiered,
//! user-facing status. Resolution is a pure function of its inputs.

use serde::{Deserialize, Serialize};

/// Status of a single connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    /// Role is connected and usable.
    Connected,
    /// Role has no connection.
    Disconnected,
    /// Role has a physical connection but awaits external pairing approval.
    PairingPending,
}

/// Combined status of both connection roles.
///
/// `Connecting` is reported by the transport during the initial dial; the
/// other seven states derive from the per-role statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinedStatus {
    Disconnected,
    Connecting,
    /// Operator connected, node down.
    PartialOperator,
    /// Node connected, operator down.
    PartialNode,
    Connected,
    PairingPendingOperator,
    PairingPendingNode,
    PairingPendingBoth,
}

impl CombinedStatus {
    /// Derive the combined status from the two role statuses.
    ///
    /// Pairing takes precedence over plain disconnection when mixed: a role
    /// awaiting approval is closer to usable than one with no link at all.
    #[must_use]
    pub fn from_roles(operator: RoleStatus, node: RoleStatus) -> Self {
        use RoleStatus::{Connected, Disconnected, PairingPending};
        match (operator, node) {
            (Connected, Connected) => Self::Connected,
            (Connected, Disconnected) | (Connected, PairingPending) => Self::PartialOperator,
            (Disconnected, Connected) | (PairingPending, Connected) => Self::PartialNode,
            (PairingPending, PairingPending) => Self::PairingPendingBoth,
            (PairingPending, Disconnected) => Self::PairingPendingOperator,
            (Disconnected, PairingPending) => Self::PairingPendingNode,
            (Disconnected, Disconnected) => Self::Disconnected,
        }
    }

    /// Whether the operator (chat) role is connected.
    #[must_use]
    pub fn operator_connected(self) -> bool {
        matches!(self, Self::Connected | Self::PartialOperator)
    }

    /// Whether the node (capabilities) role is connected.
    #[must_use]
    pub fn node_connected(self) -> bool {
        matches!(self, Self::Connected | Self::PartialNode)
    }
}

/// What the current connection allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Messaging is possible (operator role connected).
    pub chat_available: bool,
    /// The gateway can reach local device capabilities (node role connected).
    pub node_available: bool,
}

impl Capabilities {
    /// Derive capabilities from a combined status.
    ///
    /// Chat availability tracks the operator role alone: node loss must not
    /// block messaging.
    #[must_use]
    pub fn of(status: CombinedStatus) -> Self {
        Self {
            chat_available: status.operator_connected(),
            node_available: status.node_connected(),
        }
    }
}

/// Severity tier of the resolved status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Both roles connected.
    Connected,
    /// One role connected, the other missing or pending.
    Degraded,
    /// One or both roles awaiting external pairing approval, none connected.
    PendingApproval,
    /// No usable connection.
    Offline,
    /// Credentials missing; blocks everything until resolved.
    AuthRequired,
}

/// User-facing tiered connection status. Output-only, hence no
/// `Deserialize`: the static label/color strings are produced here, never
/// parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TieredStatus {
    /// Severity tier.
    pub severity: Severity,
    /// Short human label.
    pub label: &'static str,
    /// Color class for the host UI ("ok", "warn", "error", "pending").
    pub color: &'static str,
    /// Capability pair derived from the combined status.
    pub capabilities: Capabilities,
    /// Accessibility description.
    pub accessibility: String,
}

/// Resolve the raw combined status plus the auth-token-missing flag into a
/// tiered status. Pure: same input, same output.
#[must_use]
pub fn resolve_status(status: CombinedStatus, auth_token_missing: bool) -> TieredStatus {
    let capabilities = Capabilities::of(status);

    if auth_token_missing {
        return TieredStatus {
            severity: Severity::AuthRequired,
            label: "Sign-in required",
            color: "error",
            // Without credentials nothing is usable regardless of link state.
            capabilities: Capabilities {
                chat_available: false,
                node_available: false,
            },
            accessibility: "Gateway credentials are missing. Sign in to continue.".to_owned(),
        };
    }

    let (severity, label, color, accessibility) = match status {
        CombinedStatus::Connected => (
            Severity::Connected,
            "Connected",
            "ok",
            "Connected to the gateway. Chat and device capabilities available.".to_owned(),
        ),
        CombinedStatus::PartialOperator => (
            Severity::Degraded,
            "Chat only",
            "warn",
            "Chat is available. Device capabilities are offline.".to_owned(),
        ),
        CombinedStatus::PartialNode => (
            Severity::Degraded,
            "Capabilities only",
            "warn",
            "Device capabilities are available but chat is offline.".to_owned(),
        ),
        CombinedStatus::PairingPendingOperator
        | CombinedStatus::PairingPendingNode
        | CombinedStatus::PairingPendingBoth => (
            Severity::PendingApproval,
            "Awaiting approval",
            "pending",
            "Connection is waiting for pairing approval on the gateway.".to_owned(),
        ),
        CombinedStatus::Connecting => (
            Severity::Offline,
            "Connecting…",
            "pending",
            "Connecting to the gateway.".to_owned(),
        ),
        CombinedStatus::Disconnected => (
            Severity::Offline,
            "Offline",
            "error",
            "Not connected to the gateway. Messages will be queued.".to_owned(),
        ),
    };

    TieredStatus {
        severity,
        label,
        color,
        capabilities,
        accessibility,
    }
}
