fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .build_server(true) // test doubles serve GetServers in-process
        .build_client(true)
        .compile_protos(&["../shiplog/proto/log.proto"], &["../shiplog/proto"])?;
    Ok(())
}
