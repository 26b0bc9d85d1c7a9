#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let cli = courier_worker::cli::parse_cli();
    courier_worker::cli::run_with_cli(cli).await
}
