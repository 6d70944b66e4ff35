#[tokio::main]
async fn main() -> anyhow::Result<()> {
    polyglot_chat::run().await
}
