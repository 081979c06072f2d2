fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Prefer a system protoc; fall back to the vendored binary so the build
    // works on hosts without protobuf installed.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/mayastor.proto", "proto/csi.proto"],
            &["proto"],
        )?;

    Ok(())
}
