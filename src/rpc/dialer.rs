use async_trait::async_trait;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tower::util::BoxCloneSyncService;
use tower::ServiceExt;
use tracing::debug;

use super::channel::{into_box_body, Transport};
use super::errors::BoxError;
use crate::config::ServiceConfig;

/// Establishes the raw transport for a service.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, config: &ServiceConfig) -> Result<Transport, BoxError>;
}

/// Dials services over HTTP/2 with tonic.
#[derive(Debug, Clone, Default)]
pub struct TonicDialer;

impl TonicDialer {
    pub fn endpoint(config: &ServiceConfig) -> Result<Endpoint, BoxError> {
        let uri = endpoint_uri(&config.address, config.tls_enabled());
        let mut endpoint = Endpoint::from_shared(uri)?.connect_timeout(config.timeout());

        if let Some(tls) = config.tls.as_ref().filter(|tls| tls.enabled) {
            let mut tls_config = ClientTlsConfig::new().with_native_roots();
            if let Some(domain) = &tls.domain {
                tls_config = tls_config.domain_name(domain.clone());
            }
            if let Some(ca_file) = &tls.ca_file {
                let pem = std::fs::read(ca_file).map_err(|e| {
                    format!("Failed to read CA bundle {}: {}", ca_file.display(), e)
                })?;
                tls_config = tls_config.ca_certificate(Certificate::from_pem(pem));
            }
            endpoint = endpoint.tls_config(tls_config)?;
        }

        Ok(endpoint)
    }
}

#[async_trait]
impl Dialer for TonicDialer {
    async fn dial(&self, config: &ServiceConfig) -> Result<Transport, BoxError> {
        let endpoint = Self::endpoint(config)?;
        let timeout = config.timeout();
        debug!(service = %config.name, uri = %endpoint.uri(), "Dialing");

        let channel = tokio::time::timeout(timeout, endpoint.connect())
            .await
            .map_err(|_| format!("connect timed out after {}ms", timeout.as_millis()))??;

        let transport = channel
            .map_response(|response| response.map(into_box_body))
            .map_err(BoxError::from);
        Ok(BoxCloneSyncService::new(transport))
    }
}

/// Bare `host:port` addresses get a scheme matching the TLS setting.
fn endpoint_uri(address: &str, tls: bool) -> String {
    if address.contains("://") {
        address.to_string()
    } else if tls {
        format!("https://{}", address)
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::time::Duration;

    #[test]
    fn bare_addresses_get_a_scheme() {
        assert_eq!(endpoint_uri("users:50051", false), "http://users:50051");
        assert_eq!(endpoint_uri("users:443", true), "https://users:443");
        assert_eq!(endpoint_uri("http://users:8080", true), "http://users:8080");
    }

    #[test]
    fn endpoint_rejects_garbage_address() {
        let config = ServiceConfig::new("bad", "not a valid uri");
        assert!(TonicDialer::endpoint(&config).is_err());
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let config = ServiceConfig::new("secure", "secure:443").with_tls(TlsConfig {
            enabled: true,
            domain: None,
            ca_file: Some("/definitely/not/here.pem".into()),
        });
        let err = TonicDialer::endpoint(&config).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.pem"));
    }

    #[tokio::test]
    async fn refused_connection_fails_dial() {
        // Port 1 on loopback is never listening in test environments
        let config =
            ServiceConfig::new("refused", "127.0.0.1:1").with_timeout(Duration::from_secs(2));
        assert!(TonicDialer.dial(&config).await.is_err());
    }
}
