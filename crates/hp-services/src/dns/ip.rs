use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::DnsError;

/// Source of the address published in DNS records.
#[async_trait]
pub trait PublicIpResolver: Send + Sync {
    async fn resolve(&self) -> Result<IpAddr, DnsError>;
}

/// A configured address.
pub struct StaticIp(pub IpAddr);

#[async_trait]
impl PublicIpResolver for StaticIp {
    async fn resolve(&self) -> Result<IpAddr, DnsError> {
        Ok(self.0)
    }
}

/// Asks plain-text "what is my IP" endpoints in order until one answers.
pub struct HttpIpResolver {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpIpResolver {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, DnsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    async fn ask(&self, endpoint: &str) -> Result<IpAddr, DnsError> {
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let body = response.text().await?;
        parse_ip(&body)
    }
}

#[async_trait]
impl PublicIpResolver for HttpIpResolver {
    async fn resolve(&self) -> Result<IpAddr, DnsError> {
        for endpoint in &self.endpoints {
            match self.ask(endpoint).await {
                Ok(ip) => {
                    debug!(endpoint = %endpoint, ip = %ip, "Resolved public IP");
                    return Ok(ip);
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Public IP lookup failed"),
            }
        }
        Err(DnsError::PublicIp("no endpoint returned an address".to_string()))
    }
}

fn parse_ip(body: &str) -> Result<IpAddr, DnsError> {
    let text = body.trim();
    text.parse()
        .map_err(|_| DnsError::PublicIp(format!("unexpected response {:?}", text)))
}
