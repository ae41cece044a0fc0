fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(
        &[
            "proto/mvccpb/kv.proto",
            "proto/etcdserverpb/rpc.proto",
            "proto/eventserver/event.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
