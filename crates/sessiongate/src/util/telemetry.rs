use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Log output format for the control-plane binaries. Json is what the
/// regional log pipeline ingests; Compact is for running locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Default filter: controllers and the proxy at info, the HTTP and TLS
/// stacks quieted. `RUST_LOG` overrides it wholesale.
const DEFAULT_DIRECTIVES: &str =
    "info,hyper=warn,tower=warn,rustls=warn,h2=warn,kube_client=warn";

/// Initialize tracing for the operator process.
pub async fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .unwrap();
    let collector = Registry::default().with(env_filter);

    match format {
        LogFormat::Compact => {
            let logger = tracing_subscriber::fmt::layer().compact();
            tracing::subscriber::set_global_default(collector.with(logger)).unwrap();
        }
        LogFormat::Json => {
            let logger = tracing_subscriber::fmt::layer().json().flatten_event(true);
            tracing::subscriber::set_global_default(collector.with(logger)).unwrap();
        }
    }
}
