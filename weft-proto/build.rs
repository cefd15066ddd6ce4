fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Ensure protoc is available via vendored binary for reproducible builds
    if let Ok(path) = protoc_bin_vendored::protoc_bin_path() {
        std::env::set_var("PROTOC", path);
    }
    println!("cargo:rerun-if-changed=proto/runtime.proto");

    // Generate combined Rust file for package `weft.v1` to keep include path stable
    prost_build::Config::new().compile_protos(&["proto/runtime.proto"], &["proto"])?;
    Ok(())
}
