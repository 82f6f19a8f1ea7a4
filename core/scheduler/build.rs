fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "../../proto/meadowrun.proto";
    let proto_dir = "../../proto";

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(&[proto_file], &[proto_dir])?;

    println!("cargo:rerun-if-changed={}", proto_file);
    Ok(())
}
