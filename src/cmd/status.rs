//! The `status` subcommand.

use clap::Args;

use crate::{cmd::BackendOpts, prelude::*};

/// Options for the `status` subcommand.
#[derive(Args, Debug)]
pub struct StatusOpts {
    #[clap(flatten)]
    pub backend: BackendOpts,
}

/// The `status` subcommand: ask the rate-status authority directly.
///
/// Unlike the control loop, this surfaces transport errors instead of
/// failing open; as a diagnostic tool it should say what actually happened.
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let transport = opts.backend.transport()?;
    let status = transport.rate_status().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("failed to serialize rate status")?
    );
    Ok(())
}
