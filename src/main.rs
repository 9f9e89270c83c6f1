use printscp::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;
    printscp::init_logging(&config.logging)?;
    printscp::run(config).await
}
