//! The `page` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    cmd::{BackendOpts, LoopOpts},
    manifest::read_manifest,
    prelude::*,
    process_loop::AutoProcessor,
    store::{PageState, PageStore},
};

/// Options for the `page` subcommand.
#[derive(Args, Debug)]
pub struct PageOpts {
    /// Page manifest: JSONL records with `id` and `path` fields.
    pub manifest: PathBuf,

    /// The page id to process.
    #[clap(long)]
    pub page: u32,

    #[clap(flatten)]
    pub backend: BackendOpts,

    #[clap(flatten)]
    pub loop_opts: LoopOpts,
}

/// The `page` subcommand: process a single page, bypassing the loop but
/// honoring the same rate-budget gate.
#[instrument(level = "debug", skip_all, fields(page = %opts.page))]
pub async fn cmd_page(opts: &PageOpts) -> Result<()> {
    let transport = opts.backend.transport()?;
    let credential = opts.backend.credential()?;
    crate::cmd::preflight_key(&transport, &credential).await?;
    let entries = read_manifest(&opts.manifest).await?;
    let model = opts.loop_opts.resolve_model(&transport).await?;

    let store = Arc::new(PageStore::with_pages(entries));
    let processor = AutoProcessor::new(
        store,
        transport,
        credential,
        opts.loop_opts.to_config(model),
    );

    let view = processor.process_one(opts.page).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&view).context("failed to serialize page outcome")?
    );

    match view.status {
        PageState::Succeeded => Ok(()),
        _ => Err(anyhow!(
            "page {} failed: {}",
            view.id,
            view.error.as_deref().unwrap_or("unknown error")
        )),
    }
}
