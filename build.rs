fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/foreman.proto");

    // Add serde derives so registry payloads and debug dumps can be JSON-encoded
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&["proto/foreman.proto"], &["proto"])?;

    Ok(())
}
