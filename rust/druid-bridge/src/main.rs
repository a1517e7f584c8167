use druid_bridge::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    druid_bridge::run().await
}
