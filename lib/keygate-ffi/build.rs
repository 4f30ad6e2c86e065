#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::env;
use std::path::PathBuf;

/// Regenerates `include/keygate.h` from the exported `extern "C"` items.
fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR unset"));
    let header = crate_dir.join("include").join("keygate.h");
    println!("cargo:rerun-if-changed={}", header.display());

    let config = cbindgen::Config::from_file(crate_dir.join("cbindgen.toml"))
        .expect("cbindgen.toml is unreadable");

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            std::fs::create_dir_all(crate_dir.join("include"))
                .expect("cannot create include directory");
            bindings.write_to_file(&header);
        }
        // Header generation is best effort
        Err(e) => println!("cargo:warning=keygate.h not regenerated: {}", e),
    }
}
