fn main() -> Result<(), Box<dyn std::error::Error>> {
    // prefer a system protoc, fall back to the vendored binary
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // the server stubs serve kubelet, the client stubs register with it
    tonic_build::configure().compile_protos(&["proto/api.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}
