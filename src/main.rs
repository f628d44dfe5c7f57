//! remexec - interactive client
//!
//! Connects to a remexecd daemon and forwards command lines typed at the
//! prompt over a single session until `quit`.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;

use remexec::cli::{init_tracing, ClientOpts};
use remexec::client::Client;
use remexec::shell;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);

    let config = opts.client_config()?;
    let address = opts.address();
    let client = Client::connect(address.as_str(), config)
        .await
        .with_context(|| format!("Unable to connect to {}", address))?;

    shell::run(Arc::new(client), BufReader::new(tokio::io::stdin())).await
}
