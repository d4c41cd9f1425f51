use super::{Cli, Commands};
use crate::client::InferenceClient;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::metadata::ToJson;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Loads the configuration, runs one command and prints its result as
/// pretty JSON.
pub fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig::load(&cli.args)?;
    debug!(url = %config.url, workers = config.workers, "Loaded configuration");

    let client = InferenceClient::with_config(config)?;
    let output = execute(&client, &cli.command);
    client.close();

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

/// Runs `command` against `client` and returns its JSON rendering.
pub fn execute(client: &InferenceClient, command: &Commands) -> Result<Value> {
    match command {
        Commands::Live => Ok(json!({ "live": client.server_live()? })),
        Commands::Ready => Ok(json!({ "ready": client.server_ready()? })),
        Commands::ServerMetadata => client.server_metadata()?.to_json(),
        Commands::ModelMetadata { name, model_version } => client
            .model_metadata(name, model_version.as_deref())?
            .to_json(),
        Commands::ModelConfig { name, model_version } => client
            .model_config(name, model_version.as_deref())?
            .to_json(),
        Commands::ModelStats { name, model_version } => client
            .model_statistics(name.as_deref().unwrap_or_default(), model_version.as_deref())?
            .to_json(),
        Commands::Index { repository, ready } => client
            .repository_index(repository.as_deref(), *ready)?
            .to_json(),
        Commands::Load { name } => {
            client.load_model(name)?;
            info!(model = %name, "Model loaded");
            Ok(json!({ "model": name, "loaded": true }))
        }
        Commands::Unload { name } => {
            client.unload_model(name)?;
            info!(model = %name, "Model unloaded");
            Ok(json!({ "model": name, "loaded": false }))
        }
        Commands::ShmStatus { name } => client
            .system_shared_memory_status(name.as_deref())?
            .to_json(),
    }
}
