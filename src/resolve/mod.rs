//! DNS-over-HTTPS resolution
//!
//! Both the server's IPv4 address and its ESNI key record are resolved
//! over DoH so no plaintext DNS query leaves the host. The provider set
//! is closed and enumerated in [`crate::config::DohProvider`].

mod esni;

pub use esni::{fetch as fetch_esni_keys, EsniKeys, KeyShare, ESNI_KEYS_VERSION};

use crate::config::DohProvider;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

/// DoH query timeout
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS error: rcode {0}")]
    Rcode(u32),

    #[error("no answer for {0}")]
    NoAnswer(String),

    #[error("invalid address record: {0}")]
    InvalidAddress(String),

    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid ESNI keys: {0}")]
    InvalidEsniKeys(String),
}

/// DNS record types used by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Txt,
}

impl RecordType {
    fn query_name(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Txt => "TXT",
        }
    }

    fn code(&self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Txt => 16,
        }
    }
}

/// One answer record from a DoH response
#[derive(Debug, Clone, Deserialize)]
pub struct DnsAnswer {
    pub name: String,
    #[serde(rename = "type")]
    pub rrtype: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    pub data: String,
}

/// JSON DoH response body
#[derive(Debug, Deserialize)]
struct DnsResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsAnswer>,
}

/// DNS-over-HTTPS client bound to one provider
pub struct DohClient {
    http: reqwest::Client,
    provider: DohProvider,
}

impl DohClient {
    /// Create a client for the given provider
    pub fn new(provider: DohProvider) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()?;
        Ok(Self { http, provider })
    }

    /// Provider this client queries
    pub fn provider(&self) -> DohProvider {
        self.provider
    }

    /// Issue a query and return the answers matching the record type
    pub async fn lookup(
        &self,
        name: &str,
        rrtype: RecordType,
    ) -> Result<Vec<DnsAnswer>, ResolveError> {
        let response: DnsResponse = self
            .http
            .get(self.provider.endpoint())
            .query(&[("name", name), ("type", rrtype.query_name())])
            .header("accept", "application/dns-json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != 0 {
            return Err(ResolveError::Rcode(response.status));
        }

        let answers: Vec<DnsAnswer> = response
            .answer
            .into_iter()
            .filter(|a| a.rrtype == rrtype.code())
            .collect();

        if answers.is_empty() {
            return Err(ResolveError::NoAnswer(name.to_string()));
        }
        Ok(answers)
    }

    /// Resolve the first A record for a hostname
    pub async fn lookup_ipv4(&self, name: &str) -> Result<Ipv4Addr, ResolveError> {
        let answers = self.lookup(name, RecordType::A).await?;
        answers[0]
            .data
            .parse::<Ipv4Addr>()
            .map_err(|_| ResolveError::InvalidAddress(answers[0].data.clone()))
    }

    /// Return the first TXT record's data string
    pub async fn lookup_txt(&self, name: &str) -> Result<String, ResolveError> {
        let answers = self.lookup(name, RecordType::Txt).await?;
        Ok(answers[0].data.clone())
    }
}
