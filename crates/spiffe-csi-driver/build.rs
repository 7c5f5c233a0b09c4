fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds don't depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", &protoc);

    let well_known = protoc_bin_vendored::include_path()?;

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(
            &["proto/csi.proto"],
            &[std::path::Path::new("proto"), well_known.as_path()],
        )?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    Ok(())
}
