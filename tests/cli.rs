mod common;

use common::{client_with, MockTransport, SIMPLE_MODEL};
use std::sync::Arc;
use tritonstream_core::cli::handlers::execute;
use tritonstream_core::cli::Commands;

#[test]
fn test_commands_render_json() {
    let transport = Arc::new(MockTransport::new());
    let client = client_with(transport.clone(), 1);

    let live = execute(&client, &Commands::Live).unwrap();
    assert_eq!(live["live"], true);

    let metadata = execute(&client, &Commands::ServerMetadata).unwrap();
    assert_eq!(metadata["name"], "mock");

    let config = execute(
        &client,
        &Commands::ModelConfig {
            name: SIMPLE_MODEL.into(),
            model_version: None,
        },
    )
    .unwrap();
    assert_eq!(config["inputs"][0]["datatype"], "INT32");

    let loaded = execute(&client, &Commands::Load { name: "densenet".into() }).unwrap();
    assert_eq!(loaded["loaded"], true);
    assert!(transport.is_loaded("densenet"));

    let index = execute(
        &client,
        &Commands::Index {
            repository: None,
            ready: true,
        },
    )
    .unwrap();
    assert_eq!(index.as_array().unwrap().len(), 2);

    let stats = execute(
        &client,
        &Commands::ModelStats {
            name: None,
            model_version: None,
        },
    )
    .unwrap();
    assert_eq!(stats.as_array().unwrap().len(), 2);

    let regions = execute(&client, &Commands::ShmStatus { name: None }).unwrap();
    assert!(regions.as_array().unwrap().is_empty());
}

#[test]
fn test_command_errors_propagate() {
    let transport = Arc::new(MockTransport::new());
    let client = client_with(transport.clone(), 1);
    transport.set_unavailable(true);

    let err = execute(&client, &Commands::Ready).unwrap_err();
    assert!(err.is_transport());
}
