// =============================================================================
// Tern OS - Kernel Build Script
// =============================================================================
// Links the boot binary at the load address QEMU jumps to.
// =============================================================================

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../arch/arm64/linker.ld");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let script = manifest_dir.join("../arch/arm64/linker.ld");
    println!("cargo:rustc-link-arg-bins=-T{}", script.display());
}
