use std::net::IpAddr;
use crate::error::PolyrayError;
use crate::feature::{DnsClient, Feature};

/// Resolves through the host's stub resolver.
pub struct LocalDnsClient;

#[async_trait::async_trait]
impl Feature for LocalDnsClient {
    async fn start(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl DnsClient for LocalDnsClient {
    async fn lookup_ip(&self, domain: &str) -> crate::Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, 0))
            .await?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            return Err(PolyrayError::Other(anyhow::anyhow!("Empty DNS response")));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_loopback_names() {
        let client = LocalDnsClient;
        let addrs = client.lookup_ip("localhost").await.unwrap();
        assert!(addrs.iter().all(|a| a.is_loopback()));
    }
}

