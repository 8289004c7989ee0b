use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("plexus_descriptor.bin"))
        .compile_protos(
            &[
                "proto/plexus/common.proto",
                "proto/plexus/store.proto",
                "proto/plexus/workflow.proto",
                "proto/plexus/peer.proto",
                "proto/plexus/actor.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
