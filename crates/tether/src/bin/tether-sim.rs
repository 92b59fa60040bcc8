#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let result = tether::sim::run().await;

    use std::io::{self, Write};
    let _ = io::stdout().flush();

    result
}
