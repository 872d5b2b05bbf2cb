fn main() {
    capnpc::CompilerCommand::new()
        .file("drover.capnp")
        .run()
        .expect("schema compilation failed");
}
