use kube::CustomResourceExt;
use sessiongate::api::v1::Session;
use sessiongate::api::v1alpha1::CertificateSigningRequestApproval;

fn main() {
    print!("{}", serde_yaml::to_string(&Session::crd()).unwrap());
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&CertificateSigningRequestApproval::crd()).unwrap()
    );
}
