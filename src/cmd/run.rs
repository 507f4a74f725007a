//! The `run` subcommand.

use std::{pin::pin, sync::Arc, time::Duration};

use clap::Args;

use crate::{
    cmd::{BackendOpts, LoopOpts},
    manifest::read_manifest,
    prelude::*,
    process_loop::{AutoProcessor, StopReason},
    store::PageStore,
    ui::{ProgressConfig, Ui},
};

/// Options for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunOpts {
    /// Page manifest: JSONL records with `id` and `path` fields.
    pub manifest: PathBuf,

    /// Write per-page outcomes (JSONL) here instead of standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    /// Also write the transcripts of all succeeded pages to one combined
    /// text file, with page separators.
    #[clap(long)]
    pub combined: Option<PathBuf>,

    #[clap(flatten)]
    pub backend: BackendOpts,

    #[clap(flatten)]
    pub loop_opts: LoopOpts,
}

/// The `run` subcommand: register every page from the manifest, enable
/// auto-processing, and drive it until it stops.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let transport = opts.backend.transport()?;
    let credential = opts.backend.credential()?;
    crate::cmd::preflight_key(&transport, &credential).await?;
    let entries = read_manifest(&opts.manifest).await?;
    let model = opts.loop_opts.resolve_model(&transport).await?;
    info!("processing {} page(s) with model {}", entries.len(), model);

    let store = Arc::new(PageStore::with_pages(entries));
    let processor = AutoProcessor::new(
        store,
        transport,
        credential,
        opts.loop_opts.to_config(model),
    );

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing pages",
            done_msg: "OCRed pages",
        },
        processor.store().counts().total() as u64,
    );

    // Drive the loop, refreshing the progress bar as results merge in.
    let reason = {
        let mut run = pin!(processor.run());
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                reason = &mut run => break reason,
                _ = ticker.tick() => {
                    pb.set_position(processor.store().counts().resolved() as u64);
                }
            }
        }
    };
    pb.set_position(processor.store().counts().resolved() as u64);
    pb.finish_using_style();

    write_outcomes(opts.output_path.as_deref(), processor.store()).await?;
    if let Some(path) = &opts.combined {
        tokio::fs::write(path, processor.store().combined_transcript())
            .await
            .with_context(|| format!("failed to write combined transcript {:?}", path))?;
    }

    let counts = processor.store().counts();
    ui.display_message(
        "📈",
        &format!(
            "{} succeeded, {} failed, {} unprocessed",
            counts.succeeded,
            counts.failed,
            counts.pending + counts.in_flight,
        ),
    );
    if let Some(last_error) = processor.last_error() {
        ui.display_message("❌", &last_error);
    }

    if reason == StopReason::Completed {
        Ok(())
    } else {
        Err(anyhow!("auto-processing stopped early: {reason}"))
    }
}

/// Write one JSONL record per page, in registration order.
async fn write_outcomes(path: Option<&Path>, store: &PageStore) -> Result<()> {
    let mut out = String::new();
    for view in store.views() {
        out.push_str(
            &serde_json::to_string(&view).context("failed to serialize page outcome")?,
        );
        out.push('\n');
    }
    match path {
        Some(path) => tokio::fs::write(path, out)
            .await
            .with_context(|| format!("failed to write outcomes to {:?}", path)),
        None => {
            print!("{out}");
            Ok(())
        }
    }
}
