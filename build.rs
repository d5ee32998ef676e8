fn main() {
    // protox compiles the ONNX schema in pure Rust, so no system `protoc` is
    // needed; prost-build then emits `$OUT_DIR/onnx.rs`.
    let descriptors = protox::compile(["proto/onnx.proto3"], ["proto/"])
        .expect("failed to compile proto/onnx.proto3");

    prost_build::Config::new()
        .compile_fds(descriptors)
        .expect("failed to generate prost bindings for the ONNX schema");

    println!("cargo:rerun-if-changed=proto/onnx.proto3");
}
