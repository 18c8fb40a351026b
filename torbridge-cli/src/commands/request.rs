//! `torbridge request`: one proxied HTTP request.

use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use torbridge_core::{BridgeConfig, HttpMethod};
use torbridge_daemon::ProxiedRequest;

use super::system_bridge;

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Absolute URL, onion addresses included.
    pub url: String,

    /// get, post or delete.
    #[arg(short = 'X', long, default_value = "get")]
    pub method: String,

    /// Request body (POST only). Base64 for application/octet-stream.
    #[arg(short = 'd', long)]
    pub data: Option<String>,

    /// Extra header, `Name: value`. Repeatable.
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Accept invalid TLS certificates.
    #[arg(long)]
    pub insecure: bool,

    /// Print the full result object instead of the body.
    #[arg(long)]
    pub json: bool,
}

impl RequestArgs {
    pub async fn run(self, config: BridgeConfig) -> Result<()> {
        let request = self.build()?;

        let bridge = system_bridge(config);
        let outcome = async {
            bridge
                .start_daemon_default()
                .await
                .context("tor did not start")?;
            bridge
                .request(request)
                .await
                .context("proxied request failed")
        }
        .await;
        bridge.stop_daemon().await;
        let result = outcome?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&result.host_payload())
                    .context("failed to render JSON")?
            );
            return Ok(());
        }

        eprintln!(
            "{} {}",
            result.status.to_string().green().bold(),
            result.mime_type.as_deref().unwrap_or("-").dimmed()
        );
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(&result.body)
            .and_then(|_| stdout.flush())
            .context("failed to write response body")?;
        Ok(())
    }

    /// Validates everything that can be checked without tor.
    fn build(&self) -> Result<ProxiedRequest> {
        let method: HttpMethod = self.method.parse()?;
        let mut request = ProxiedRequest::new(self.url.clone(), method)
            .trust_invalid_certificates(self.insecure);
        request.parsed_url()?;
        for raw in &self.headers {
            let Some((name, value)) = raw.split_once(':') else {
                bail!("invalid header '{raw}', expected 'Name: value'");
            };
            request = request.header(name.trim(), value.trim());
        }
        if let Some(data) = &self.data {
            request = request.body(data.clone());
        }
        Ok(request)
    }
}
