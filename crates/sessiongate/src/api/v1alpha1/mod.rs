pub mod csrapproval;
pub use csrapproval::{CertificateSigningRequestApproval, CertificateSigningRequestApprovalSpec};
