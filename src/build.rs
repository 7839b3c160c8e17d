fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/rpc.capnp")
        .file("schema/raft.capnp")
        .run()
        .expect("compiling raft capnp schema");
}
