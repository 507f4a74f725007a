use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod budget;
mod classify;
mod cmd;
mod credential;
mod data_url;
mod dispatch;
mod manifest;
mod prelude;
mod process_loop;
mod store;
mod transport;
mod ui;

/// OCR page images through a remote model, within a rate budget.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_PILOT_API_BASE (optional): Override the backend URL.
  - OCR_PILOT_API_KEY: The API key to use.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process every page in a manifest, retrying around rate limits.
    Run(cmd::run::RunOpts),
    /// Process a single page from a manifest.
    Page(cmd::page::PageOpts),
    /// Show the backend's current rate-limit status.
    Status(cmd::status::StatusOpts),
    /// List the OCR models the backend offers.
    Models(cmd::models::ModelsOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(opts) => opts.output_path.is_none(),
            Cmd::Page(_) | Cmd::Status(_) | Cmd::Models(_) => true,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(opts) => {
            cmd::run::cmd_run(ui, opts).await?;
        }
        Cmd::Page(opts) => {
            cmd::page::cmd_page(opts).await?;
        }
        Cmd::Status(opts) => {
            cmd::status::cmd_status(opts).await?;
        }
        Cmd::Models(opts) => {
            cmd::models::cmd_models(opts).await?;
        }
    }
    Ok(())
}
