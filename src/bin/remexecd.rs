use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use remexec::cli::{init_tracing, DaemonOpts};
use remexec::server::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let config = opts.server_config()?;

    println!("Starting remexec daemon:");
    println!("  Root: {}", config.root.display());
    println!("  Bind: {}", config.bind);
    println!("  Compiler: {}", config.settings.compiler);
    if let Some(log) = &config.log_file {
        println!("  Audit log: {}", log.display());
    }

    // Security warning for 0.0.0.0 binding
    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        eprintln!("   The protocol is UNENCRYPTED and UNAUTHENTICATED and runs uploaded code");
        eprintln!("   Only use on trusted networks");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let server = Server::bind(config).await?;
        info!(addr = %server.local_addr()?, "daemon listening");
        if let Err(err) = server.run_until_ctrl_c().await {
            warn!("daemon exited with error: {err:?}");
            return Err(err);
        }
        Ok(())
    })
}
