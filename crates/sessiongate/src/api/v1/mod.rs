use core::fmt;
use std::fmt::Display;

pub mod session;
pub use session::{
    HostedClusterRef, Session, SessionOwner, SessionSpec, SessionStatus, SESSION_FINALIZER,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a breakglass session. `Terminated` is terminal.
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SessionPhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Expiring,
    Terminated,
}

impl Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let phase = match self {
            SessionPhase::Pending => "Pending",
            SessionPhase::Provisioning => "Provisioning",
            SessionPhase::Ready => "Ready",
            SessionPhase::Expiring => "Expiring",
            SessionPhase::Terminated => "Terminated",
        };
        write!(f, "{phase}")
    }
}

/// The identity kind behind a session, deciding which claim header the proxy
/// validates.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SessionOwnerType {
    AzureUser,
    AzureServicePrincipal,
}
