//! Build script for tritonstream: compiles the vendored inference protocol.

use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = Path::new("proto");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", proto_dir.display());

    // Use a system protoc when one is configured.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .compile_protos(
            &[
                proto_dir.join("grpc_service.proto"),
                proto_dir.join("model_config.proto"),
            ],
            &[proto_dir],
        )?;

    Ok(())
}
