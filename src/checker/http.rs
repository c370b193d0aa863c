use async_trait::async_trait;
use tracing::debug;

use super::Checker;
use crate::config::Config;
use crate::error::DaemonError;

/// Reference probe: a single unauthenticated GET against a local endpoint.
///
/// Healthy iff the status code matches `http-expected-code` and, when one of
/// the body expectations is configured, the body matches it: an exact match
/// when `http-expected-response` is set, otherwise a substring match when
/// `http-expected-response-contains` is set.
pub struct HttpChecker {
    http: reqwest::Client,
    url: String,
    expected_code: u16,
    expected_response: String,
    expected_response_contains: String,
}

impl HttpChecker {
    pub fn new(conf: &Config) -> Result<Self, DaemonError> {
        let http = reqwest::Client::builder()
            .timeout(conf.interval)
            .no_proxy()
            .build()
            .map_err(|e| DaemonError::Config(format!("cannot build probe client: {}", e)))?;

        Ok(Self {
            http,
            url: conf.http_url.clone(),
            expected_code: conf.http_expected_code,
            expected_response: conf.http_expected_response.clone(),
            expected_response_contains: conf.http_expected_response_contains.clone(),
        })
    }

    fn matches_expectation(&self, code: u16, body: &str) -> bool {
        if code != self.expected_code {
            return false;
        }
        if !self.expected_response.is_empty() {
            return body == self.expected_response;
        }
        if !self.expected_response_contains.is_empty() {
            return body.contains(&self.expected_response_contains);
        }
        true
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn is_healthy(&self) -> Result<bool, DaemonError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DaemonError::CheckerTransport(e.to_string()))?;

        let code = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| DaemonError::CheckerProtocol(e.to_string()))?;

        debug!("checker: http probe returned code={}, body={:?}", code, body);
        Ok(self.matches_expectation(code, &body))
    }
}
