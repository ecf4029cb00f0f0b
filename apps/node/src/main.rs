use eyre::Result;

mod cli;
pub(crate) mod config;
mod controller;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
