use clap::Parser;
use color_eyre::eyre::Result;

mod app;
mod cli;
mod ui;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = cli::Args::parse();
    let _log_guard = args.log_dir.as_deref().map(cli::init_tracing);
    let config = args.resolve()?;
    app::run_app(config).await
}
