#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metric_refresh::run().await?;
    Ok(())
}
