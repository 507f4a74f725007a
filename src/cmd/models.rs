//! The `models` subcommand.

use clap::Args;

use crate::{cmd::BackendOpts, prelude::*};

/// Options for the `models` subcommand.
#[derive(Args, Debug)]
pub struct ModelsOpts {
    #[clap(flatten)]
    pub backend: BackendOpts,
}

/// The `models` subcommand: list the models the backend offers.
pub async fn cmd_models(opts: &ModelsOpts) -> Result<()> {
    let transport = opts.backend.transport()?;
    let catalog = transport.models().await?;
    for model in &catalog.models {
        let marker = if model.id == catalog.default {
            " (default)"
        } else {
            ""
        };
        println!("{}{}", model.id, marker);
        println!("    {}: {}", model.name, model.description);
    }
    Ok(())
}
