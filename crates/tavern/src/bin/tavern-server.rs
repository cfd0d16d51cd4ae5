#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tavern::server::run().await
}
