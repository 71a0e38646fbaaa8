//! Deterministic service identity
//!
//! A service's id is a pure function of its identifying configuration
//! fields. The same configuration yields the same id across daemon
//! restarts, which is what makes persisted-state reconciliation possible;
//! tags, descriptions, and probe tuning never move the id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Connection, Technology};

/// Fixed namespace for LocalPort service ids. Changing this would orphan
/// every persisted entry, so it never changes.
const SERVICE_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6c, 0x70, 0x74, 0x00, 0x9a, 0x1b, 0x4f, 0x83, 0x8e, 0x5d, 0x21, 0x47, 0xd0, 0xc4, 0xaa,
    0x31,
]);

/// 128-bit deterministic service identifier (UUIDv5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Derive the id from the identifying fields only.
    ///
    /// Identity material per technology:
    /// - kubernetes: `namespace/resource_type/resource_name[/context]`
    /// - ssh: `host:port[@user]`
    pub fn derive(
        name: &str,
        technology: Technology,
        local_port: u16,
        remote_port: u16,
        connection: &Connection,
    ) -> Self {
        let connection_identity = match connection {
            Connection::Kubernetes(k) => {
                let mut identity = format!("{}/{}/{}", k.namespace, k.resource_type, k.resource_name);
                if let Some(ref context) = k.context {
                    identity.push('/');
                    identity.push_str(context);
                }
                identity
            }
            Connection::Ssh(s) => {
                let mut identity = format!("{}:{}", s.host, s.port);
                if let Some(ref user) = s.user {
                    identity.push('@');
                    identity.push_str(user);
                }
                identity
            }
        };

        let material = format!(
            "{}|{}|{}|{}|{}",
            name,
            technology.as_str(),
            local_port,
            remote_port,
            connection_identity
        );

        ServiceId(Uuid::new_v5(&SERVICE_ID_NAMESPACE, material.as_bytes()))
    }

    /// Short prefix used in log file names and compact displays
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ServiceId(Uuid::parse_str(s)?))
    }
}
