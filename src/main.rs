use anyhow::Context;
use formgate::{config::AdmissionConfig, init_admission, init_tracing};
use std::env;

const DEFAULT_CONFIG_PATH: &str = "config/formgate.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // Logging settings live in the config, so load it first
    let config = AdmissionConfig::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: formgate [config_file])",
            config_path
        )
    })?;

    init_tracing(&config.logging);

    init_admission(config).await.context("Admission server error")?;
    Ok(())
}
