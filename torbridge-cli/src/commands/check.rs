//! `torbridge check`: bootstrap tor once and report.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use torbridge_core::BridgeConfig;

use super::system_bridge;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckArgs {
    pub async fn run(self, config: BridgeConfig) -> Result<()> {
        let bridge = system_bridge(config);
        let outcome = async {
            let port = bridge
                .start_daemon_default()
                .await
                .context("tor did not start")?;
            let status = bridge
                .daemon_status()
                .await
                .context("failed to query tor status")?;
            Ok::<_, anyhow::Error>((port, status))
        }
        .await;
        bridge.stop_daemon().await;
        let (port, status) = outcome?;

        if self.json {
            let payload = serde_json::json!({
                "socksPort": port,
                "status": status,
                "workDir": bridge.config().work_dir.display().to_string(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to render JSON")?
            );
            return Ok(());
        }

        println!("{} socks5h://127.0.0.1:{port}", "tor ok".green().bold());
        println!("  status:   {status}");
        println!("  work dir: {}", bridge.config().work_dir.display());
        Ok(())
    }
}
