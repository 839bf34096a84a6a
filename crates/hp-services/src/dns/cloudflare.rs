use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::DnsError;

/// Cloudflare's "record does not exist" error code.
const RECORD_NOT_FOUND: u32 = 81044;

/// An address record to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub content: String,
    /// 1 means automatic.
    pub ttl: u32,
    pub proxied: bool,
}

impl RecordSpec {
    pub fn address(name: impl Into<String>, ip: IpAddr, proxied: bool) -> Self {
        Self {
            kind: if ip.is_ipv4() { "A" } else { "AAAA" },
            name: name.into(),
            content: ip.to_string(),
            ttl: 1,
            proxied,
        }
    }
}

/// Authoritative DNS provider operations the sync engine needs.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Whether credentials are present. Nothing is attempted otherwise.
    fn is_configured(&self) -> bool;

    /// Zone id for an exact zone name.
    async fn find_zone(&self, name: &str) -> Result<Option<String>, DnsError>;

    /// Create a record and return its id.
    async fn create_record(&self, zone_id: &str, record: &RecordSpec) -> Result<String, DnsError>;

    /// Overwrite a record. [`DnsError::NotFound`] when the id is stale.
    async fn update_record(&self, zone_id: &str, record_id: &str, record: &RecordSpec) -> Result<(), DnsError>;

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), DnsError>;

    /// Status reported for the API token.
    async fn verify_token(&self) -> Result<String, DnsError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenStatus {
    status: String,
}

/// Cloudflare v4 REST client authenticated with an API token.
pub struct CloudflareClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl CloudflareClient {
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Result<Self, DnsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hostpanel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, DnsError> {
        let token = self.token.as_deref().ok_or(DnsError::NotConfigured)?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        decode(status, &body)
    }
}

/// Unwrap a Cloudflare response envelope.
fn decode<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, DnsError> {
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if status == 404 => return Err(DnsError::NotFound),
        Err(e) => return Err(DnsError::Api(format!("HTTP {}: {}", status, e))),
    };

    if envelope.success {
        return envelope
            .result
            .ok_or_else(|| DnsError::Api(format!("HTTP {}: response has no result", status)));
    }
    if status == 404 || envelope.errors.iter().any(|e| e.code == RECORD_NOT_FOUND) {
        return Err(DnsError::NotFound);
    }
    let messages: Vec<String> = envelope
        .errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect();
    Err(DnsError::Api(if messages.is_empty() {
        format!("HTTP {}", status)
    } else {
        messages.join("; ")
    }))
}

#[async_trait]
impl DnsProvider for CloudflareClient {
    fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    async fn find_zone(&self, name: &str) -> Result<Option<String>, DnsError> {
        let zones: Vec<IdOnly> = self
            .send(self.client.get(self.url("/zones")).query(&[("name", name)]))
            .await?;
        debug!(zone = %name, found = !zones.is_empty(), "Zone lookup");
        Ok(zones.into_iter().next().map(|z| z.id))
    }

    async fn create_record(&self, zone_id: &str, record: &RecordSpec) -> Result<String, DnsError> {
        let created: IdOnly = self
            .send(
                self.client
                    .post(self.url(&format!("/zones/{}/dns_records", zone_id)))
                    .json(record),
            )
            .await?;
        Ok(created.id)
    }

    async fn update_record(&self, zone_id: &str, record_id: &str, record: &RecordSpec) -> Result<(), DnsError> {
        let _: IdOnly = self
            .send(
                self.client
                    .put(self.url(&format!("/zones/{}/dns_records/{}", zone_id, record_id)))
                    .json(record),
            )
            .await?;
        Ok(())
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), DnsError> {
        let _: IdOnly = self
            .send(
                self.client
                    .delete(self.url(&format!("/zones/{}/dns_records/{}", zone_id, record_id))),
            )
            .await?;
        Ok(())
    }

    async fn verify_token(&self) -> Result<String, DnsError> {
        let status: TokenStatus = self
            .send(self.client.get(self.url("/user/tokens/verify")))
            .await?;
        Ok(status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_decode_success() {
        let body = r#"{"success":true,"errors":[],"messages":[],"result":{"id":"372e67954025e0ba6aaa6d586b9e0b59","type":"A"}}"#;
        let record: IdOnly = decode(200, body).unwrap();
        assert_eq!(record.id, "372e67954025e0ba6aaa6d586b9e0b59");
    }

    #[test]
    fn test_decode_missing_record() {
        let body = r#"{"success":false,"errors":[{"code":81044,"message":"Record does not exist."}],"result":null}"#;
        assert!(matches!(decode::<IdOnly>(400, body), Err(DnsError::NotFound)));
        assert!(matches!(decode::<IdOnly>(404, "not found"), Err(DnsError::NotFound)));
    }

    #[test]
    fn test_decode_api_error_keeps_messages() {
        let body = r#"{"success":false,"errors":[{"code":10000,"message":"Authentication error"}]}"#;
        let err = decode::<IdOnly>(403, body).unwrap_err();
        assert_eq!(err.to_string(), "DNS provider error: Authentication error (10000)");
    }

    #[test]
    fn test_record_type_follows_address_family() {
        let v4 = RecordSpec::address("example.com", "203.0.113.7".parse().unwrap(), false);
        assert_eq!(v4.kind, "A");
        let v6 = RecordSpec::address("example.com", IpAddr::V6(Ipv6Addr::LOCALHOST), true);
        assert_eq!(v6.kind, "AAAA");
        let json = serde_json::to_value(&v4).unwrap();
        assert_eq!(json["type"], "A");
        assert_eq!(json["ttl"], 1);
    }

    #[test]
    fn test_blank_token_is_not_configured() {
        let client = CloudflareClient::new("https://api.example.test/", Some("  ".into()), Duration::from_secs(5)).unwrap();
        assert!(!client.is_configured());
        assert_eq!(client.url("/zones"), "https://api.example.test/zones");
    }
}
