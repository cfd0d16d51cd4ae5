#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tavern::client::run().await
}
