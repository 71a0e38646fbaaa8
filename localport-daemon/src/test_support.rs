//! Shared helpers for unit tests

use std::time::Duration;

use crate::config::{
    Connection, HealthCheckConfig, KubernetesConnection, ResolvedService, RestartPolicy,
    Technology,
};
use crate::identity::ServiceId;

/// A kubernetes-backed service definition with default tuning
pub(crate) fn test_definition(name: &str, local_port: u16) -> ResolvedService {
    let connection = Connection::Kubernetes(KubernetesConnection {
        resource_type: "service".to_string(),
        resource_name: name.to_string(),
        namespace: "default".to_string(),
        context: None,
    });
    let id = ServiceId::derive(name, Technology::Kubernetes, local_port, local_port, &connection);
    ResolvedService {
        id,
        name: name.to_string(),
        technology: Technology::Kubernetes,
        local_port,
        remote_port: local_port,
        connection,
        enabled: true,
        tags: Vec::new(),
        description: None,
        health_check: HealthCheckConfig::default(),
        restart_policy: RestartPolicy::default(),
        stop_grace_period: Duration::from_secs(5),
    }
}
