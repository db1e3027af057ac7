// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{env, path::Path};

fn main() {
    let in_dir = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap()).join("protobuf");
    let proto = in_dir.join("update_metadata.proto");

    println!("cargo:rerun-if-changed={}", in_dir.to_str().unwrap());

    // protox is a pure-Rust protobuf compiler, so no protoc binary is needed
    // at build time.
    let fds = protox::compile([&proto], [&in_dir]).unwrap();

    prost_build::Config::new()
        .compile_fds(fds)
        .unwrap();
}
