use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Companion approval resource for the hosted cluster's break-glass signer.
/// Its existence, matched by name to a CertificateSigningRequest, is what
/// the signer's approval controller acts on; the spec carries no fields.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    kind = "CertificateSigningRequestApproval",
    group = "certificates.hypershift.openshift.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSigningRequestApprovalSpec {}
