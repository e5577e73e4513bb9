use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hierarchical ARM resource identifier:
/// `/subscriptions/{subId}/resourceGroups/{rg}/providers/{ns}/{type}/{name}[/{childType}/{childName}]`.
///
/// Resource-type segments compare case-insensitively; the canonical queue key
/// is the whole id lowercased, while `Display` preserves the original casing
/// of names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceId {
    pub subscription_id: String,
    pub resource_group: String,
    pub provider_namespace: String,
    pub resource_type: String,
    pub name: String,
    pub child_type: Option<String>,
    pub child_name: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid resource id {0:?}: {1}")]
pub struct ParseError(pub String, pub &'static str);

impl ResourceId {
    /// Canonical lowercase form used as the queue and persistence key.
    pub fn canonical_key(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    /// Case-insensitive resource-type match against `{ns}/{type}`.
    pub fn is_type(&self, provider_namespace: &str, resource_type: &str) -> bool {
        self.provider_namespace.eq_ignore_ascii_case(provider_namespace)
            && self.resource_type.eq_ignore_ascii_case(resource_type)
    }

    pub fn is_child(&self) -> bool {
        self.child_type.is_some()
    }

    /// The parent id of a child resource, or a clone of self for top-level ids.
    pub fn parent(&self) -> ResourceId {
        ResourceId {
            child_type: None,
            child_name: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription_id, self.resource_group, self.provider_namespace, self.resource_type, self.name
        )?;
        if let (Some(ct), Some(cn)) = (&self.child_type, &self.child_name) {
            write!(f, "/{ct}/{cn}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseError(s.to_string(), reason);
        let mut segments = s.split('/');
        if segments.next() != Some("") {
            return Err(err("must start with '/'"));
        }
        let mut expect = |marker: &'static str| -> Result<&str, ParseError> {
            match segments.next() {
                Some(seg) if seg.eq_ignore_ascii_case(marker) => segments
                    .next()
                    .filter(|v| !v.is_empty())
                    .ok_or(ParseError(s.to_string(), "missing segment value")),
                _ => Err(ParseError(s.to_string(), "unexpected segment")),
            }
        };
        let subscription_id = expect("subscriptions")?.to_string();
        let resource_group = expect("resourceGroups")?.to_string();
        let provider_namespace = expect("providers")?.to_string();
        let resource_type = segments
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| err("missing resource type"))?
            .to_string();
        let name = segments
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| err("missing resource name"))?
            .to_string();

        let (child_type, child_name) = match (segments.next(), segments.next()) {
            (None, _) => (None, None),
            (Some(ct), Some(cn)) if !ct.is_empty() && !cn.is_empty() => {
                (Some(ct.to_string()), Some(cn.to_string()))
            }
            _ => return Err(err("dangling child segments")),
        };
        if segments.next().is_some() {
            return Err(err("trailing segments"));
        }

        Ok(ResourceId {
            subscription_id,
            resource_group,
            provider_namespace,
            resource_type,
            name,
            child_type,
            child_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_ID: &str =
        "/subscriptions/s/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/c1";

    #[test]
    fn parses_cluster_id() {
        let id: ResourceId = CLUSTER_ID.parse().unwrap();
        assert_eq!(id.subscription_id, "s");
        assert_eq!(id.resource_group, "rg");
        assert_eq!(id.provider_namespace, "Microsoft.RedHatOpenShift");
        assert_eq!(id.resource_type, "hcpOpenShiftClusters");
        assert_eq!(id.name, "c1");
        assert!(!id.is_child());
        assert_eq!(id.to_string(), CLUSTER_ID);
    }

    #[test]
    fn parses_node_pool_child() {
        let raw = format!("{CLUSTER_ID}/nodePools/np1");
        let id: ResourceId = raw.parse().unwrap();
        assert!(id.is_child());
        assert_eq!(id.child_type.as_deref(), Some("nodePools"));
        assert_eq!(id.child_name.as_deref(), Some("np1"));
        assert_eq!(id.parent().to_string(), CLUSTER_ID);
    }

    #[test]
    fn canonical_key_is_lowercase_but_display_preserves_case() {
        let id: ResourceId = CLUSTER_ID.parse().unwrap();
        assert_eq!(id.canonical_key(), CLUSTER_ID.to_ascii_lowercase());
        assert!(id.to_string().contains("Microsoft.RedHatOpenShift"));
    }

    #[test]
    fn type_comparison_is_case_insensitive() {
        let id: ResourceId = CLUSTER_ID.parse().unwrap();
        assert!(id.is_type("microsoft.redhatopenshift", "HCPOPENSHIFTCLUSTERS"));
        assert!(!id.is_type("Microsoft.Compute", "hcpOpenShiftClusters"));
    }

    #[test]
    fn fixed_markers_are_case_insensitive() {
        let raw = "/SUBSCRIPTIONS/s/resourcegroups/rg/Providers/ns/t/n";
        let id: ResourceId = raw.parse().unwrap();
        assert_eq!(id.name, "n");
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in [
            "",
            "subscriptions/s",
            "/subscriptions/s/resourceGroups/rg",
            "/subscriptions/s/resourceGroups/rg/providers/ns/t",
            "/subscriptions/s/resourceGroups/rg/providers/ns/t/n/child",
            "/subscriptions/s/resourceGroups/rg/providers/ns/t/n/ct/cn/extra",
        ] {
            assert!(raw.parse::<ResourceId>().is_err(), "accepted {raw:?}");
        }
    }
}
