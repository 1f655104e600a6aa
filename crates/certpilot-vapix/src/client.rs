//! HTTP transport to the device

use crate::soap;
use certpilot_core::{Credentials, Error, Result};
use std::time::Duration;

/// Default timeout for every device request
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const SOAP_PATH: &str = "/vapix/services";
const CIPHERS_PATH: &str = "/axis-cgi/param.cgi?action=list&group=HTTPS.Ciphers";

/// Authenticated client for the device's SOAP and CGI endpoints
pub struct DeviceClient {
    base_url: String,
    credentials: Credentials,
    client: reqwest::Client,
}

// Password redaction comes from Credentials' Debug
impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl DeviceClient {
    /// Create a client for the device at `base_url`
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        Self::with_timeout(base_url, credentials, DEFAULT_HTTP_TIMEOUT)
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            client,
        })
    }

    /// Device base URL, without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` wrapped in a SOAP envelope and return the response text
    ///
    /// # Errors
    ///
    /// - `ProtocolFault` when the response carries a SOAP fault
    /// - `HttpStatus` for any other status than 200
    /// - `Network` when the device cannot be reached
    pub async fn call(&self, body: &str) -> Result<String> {
        let url = format!("{}{SOAP_PATH}", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .header(reqwest::header::CONTENT_TYPE, "application/soap+xml")
            .body(soap::envelope(body))
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        tracing::trace!(status, bytes = text.len(), "SOAP response");

        soap::check_response(status, &text)?;
        Ok(text)
    }

    /// Cipher suites the device's web server supports
    pub async fn fetch_ciphers(&self) -> Result<Vec<String>> {
        let url = format!("{}{CIPHERS_PATH}", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::HttpStatus { status });
        }

        let text = response.text().await?;
        soap::parse_ciphers(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = DeviceClient::new("http://127.0.0.12/", Credentials::new("root", "pass")).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.12");
    }

    #[test]
    fn debug_hides_password() {
        let client =
            DeviceClient::new("http://127.0.0.12", Credentials::new("root", "hunter2")).unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("root"));
        assert!(!debug.contains("hunter2"));
    }
}
