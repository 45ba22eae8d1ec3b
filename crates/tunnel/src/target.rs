//! Remote target references.

use std::fmt;

use crate::error::{Result, TunnelError};

const MAX_LABEL_LEN: usize = 63;
const MAX_SUBDOMAIN_LEN: usize = 253;

/// A pod addressed by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodTarget {
    namespace: String,
    name: String,
}

impl PodTarget {
    /// Create a validated pod target.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::InvalidTarget` when the namespace is not a
    /// DNS-1123 label or the pod name is not a DNS-1123 subdomain.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();

        validate_label(&namespace)
            .map_err(|reason| TunnelError::invalid_target(format!("namespace '{namespace}' {reason}")))?;
        validate_subdomain(&name)
            .map_err(|reason| TunnelError::invalid_target(format!("pod name '{name}' {reason}")))?;

        Ok(Self { namespace, name })
    }

    /// Namespace of the pod.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the pod.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the port-forward sub-resource on the cluster API server.
    pub fn portforward_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/pods/{}/portforward",
            self.namespace, self.name
        )
    }
}

impl fmt::Display for PodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn validate_label(value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(format!("must be at most {MAX_LABEL_LEN} characters"));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric());

    if valid_chars && valid_edges {
        Ok(())
    } else {
        Err("must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character".to_string())
    }
}

fn validate_subdomain(value: &str) -> std::result::Result<(), String> {
    if value.len() > MAX_SUBDOMAIN_LEN {
        return Err(format!("must be at most {MAX_SUBDOMAIN_LEN} characters"));
    }
    value.split('.').try_for_each(validate_label)
}
