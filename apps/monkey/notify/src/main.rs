//! Monkey Notify - Entry Point
//!
//! Submits one notification through the dispatch engine and waits for it.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    monkey_notify::run().await
}
