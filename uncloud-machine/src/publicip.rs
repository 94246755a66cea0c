//! Best-effort public IP detection for advertised endpoints.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;

const LOOKUP_URLS: &[&str] = &["https://api.ipify.org", "https://icanhazip.com"];
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Asks well-known reflector services for this machine's public address.
/// Returns `None` when none of them can be reached.
pub async fn detect() -> Option<IpAddr> {
    let client = Client::builder().timeout(LOOKUP_TIMEOUT).build().ok()?;
    for url in LOOKUP_URLS {
        match lookup(&client, url).await {
            Ok(ip) => return Some(ip),
            Err(e) => log::debug!("public IP lookup via {url} failed: {e}"),
        }
    }
    None
}

async fn lookup(
    client: &Client,
    url: &str,
) -> Result<IpAddr, Box<dyn std::error::Error + Send + Sync>> {
    let body = client.get(url).send().await?.text().await?;
    Ok(body.trim().parse()?)
}
