mod allocation;
mod app;
mod config;
mod discovery;
mod inventory;
mod metrics;
mod signals;
mod utils;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
  color_eyre::install()?;
  app::run().await
}
