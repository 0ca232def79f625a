//! Server configuration, from flags or environment variables.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "capnet-server", about = "Capability issuance and enforcement core")]
pub struct ServerConfig {
    /// Address for the HTTP API.
    #[arg(long, env = "CAPNET_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// Directory holding capabilities, revocations, issuer keys, and
    /// the audit log.
    #[arg(long, env = "CAPNET_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Extra allowed CORS origin besides loopback (e.g. a browser
    /// extension origin such as `chrome-extension://<id>`).
    #[arg(long, env = "CAPNET_EXTENSION_ORIGIN")]
    pub extension_origin: Option<String>,
}
