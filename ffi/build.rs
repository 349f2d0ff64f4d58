use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/types.rs");

    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let include_dir = PathBuf::from(&crate_dir).join("include");
    if let Err(e) = fs::create_dir_all(&include_dir) {
        println!("cargo:warning=cannot create {}: {e}", include_dir.display());
        return;
    }

    let generated = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("NETREQ_H")
        .with_documentation(true)
        .generate();
    match generated {
        Ok(bindings) => {
            bindings.write_to_file(include_dir.join("netreq.h"));
        }
        Err(e) => println!("cargo:warning=header not generated: {e}"),
    }
}
