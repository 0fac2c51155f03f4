mod adaptive_task;
mod blob_store;
mod buttons;
mod host;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
