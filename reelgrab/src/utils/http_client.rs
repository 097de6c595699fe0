use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Shared client settings. Request timeouts are set per call, since long
/// polls and uploads need very different bounds.
pub fn build_client(user_agent: &str) -> reqwest::Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}
