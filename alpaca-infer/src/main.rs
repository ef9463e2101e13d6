#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alpaca_core::session;
use alpaca_core::InferenceArgs;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = InferenceArgs::parse();
    let config = args.validate()?;
    info!(
        base_model = %config.loader.base_model,
        backend = %config.backend,
        alpha = %config.alpha,
        "starting session"
    );
    session::run(config)?;
    Ok(())
}
