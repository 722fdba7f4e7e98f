#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = autograde_rust::run().await {
        eprintln!("autograde-rust fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
