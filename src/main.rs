use clap::Parser;
use snapshot_e2e::{
    clients::kubernetes::new_client,
    config::ScenarioConfig,
    error::Result,
    logging,
    namespace::{TestNamespace, DEFAULT_BASE_NAME},
    scenario::DynamicallyProvisionedVolumeSnapshotTest,
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "snapshot-e2e",
    version,
    about = "Snapshot and restore end-to-end test for a CSI disk driver"
)]
struct Opts {
    /// Scenario file; built-in defaults are used when omitted.
    #[arg(long, env = "SNAPSHOT_E2E_CONFIG")]
    config: Option<PathBuf>,

    /// Run inside this existing namespace instead of a generated one.
    #[arg(long, env = "SNAPSHOT_E2E_NAMESPACE")]
    namespace: Option<String>,

    /// Leave the test namespace behind for debugging.
    #[arg(long)]
    keep_namespace: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    match run(Opts::parse()).await {
        Ok(()) => {
            info!("scenario passed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "scenario failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Opts) -> Result<()> {
    let config = match opts.config {
        Some(path) => ScenarioConfig::from_path(path)?,
        None => ScenarioConfig::default(),
    };

    let client = new_client().await?;
    let namespace = match opts.namespace {
        Some(name) => TestNamespace::existing(client.clone(), &name),
        None => TestNamespace::create(client.clone(), DEFAULT_BASE_NAME).await?,
    };

    let test = DynamicallyProvisionedVolumeSnapshotTest::from(&config);
    let result = test.run(&client, namespace.name()).await;

    if opts.keep_namespace {
        info!(namespace = %namespace.name(), "keeping test namespace");
        return result;
    }

    let cleanup = namespace
        .cleanup(config.timeouts.namespace_deletion())
        .await;
    result.and(cleanup)
}
