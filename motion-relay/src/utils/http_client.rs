use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

use crate::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("motion-relay/", env!("CARGO_PKG_VERSION"));

/// Install the aws-lc-rs rustls provider once per process.
///
/// reqwest is built without a bundled provider, so this must run before the
/// first client is created.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared HTTP client.
///
/// Request timeouts are set per call; only connecting is bounded here.
pub fn build_client(accept_invalid_certs: bool) -> Result<reqwest::Client> {
    install_rustls_provider();

    if accept_invalid_certs {
        warn!("TLS certificate verification is disabled for Surveillance Station");
    }

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client() {
        assert!(build_client(false).is_ok());
        assert!(build_client(true).is_ok());
    }

    #[test]
    fn test_install_provider_is_idempotent() {
        install_rustls_provider();
        install_rustls_provider();
    }
}
