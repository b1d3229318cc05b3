//! Build script generating the gRPC metrics service.

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("proto");

    // Prefer a system protoc when one is configured.
    if env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
        env::set_var("PROTOC", protoc);
    }

    println!("cargo:rerun-if-changed={}", proto_root.display());

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[allow(clippy::all, clippy::pedantic)]")
        .compile(&[proto_root.join("synapse/v1/metrics.proto")], &[proto_root])?;

    Ok(())
}
