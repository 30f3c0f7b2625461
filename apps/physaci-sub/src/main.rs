use anyhow::Context;

use physaci_sub::cli::{self, Cli};
use physaci_sub::config::ConfigResolver;
use physaci_sub::logging;
use physaci_sub::subscribe::SubscriptionClient;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = cli::parse();

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("physaci-sub: failed to initialize logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(cli).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let resolver = ConfigResolver::load_from(cli.config);
    let mut client = SubscriptionClient::new(resolver).context("could not set up subscriber")?;
    client
        .send_subscription()
        .await
        .context("subscription not renewed")?;
    Ok(())
}
