use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("QUIRE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match quire::run().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_contract_violation() => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
        Err(e) => Err(anyhow::Error::new(e).context("quire command failed")),
    }
}
