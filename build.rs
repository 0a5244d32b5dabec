use std::env;
use std::fs;
use std::path::PathBuf;

/// Public key that signs controller modules, SEC1 hex (compressed or not).
const MODULE_KEY_VAR: &str = "TICKRT_MODULE_KEY";

fn main() {
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed={}", MODULE_KEY_VAR);

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));

    if env::var_os("CARGO_FEATURE_FIRMWARE").is_some() {
        let hex = env::var(MODULE_KEY_VAR)
            .unwrap_or_else(|_| panic!("{} must hold the module signing public key (SEC1 hex)", MODULE_KEY_VAR));
        let key = parse_sec1_hex(hex.trim()).unwrap_or_else(|err| panic!("{}: {}", MODULE_KEY_VAR, err));
        fs::write(
            out_dir.join("module_key.rs"),
            format!("static MODULE_KEY: [u8; {}] = {:?};\n", key.len(), key),
        )
        .expect("write module_key.rs");
    }

    // memory.x only matters when linking the firmware for a Cortex-M target
    let target = env::var("TARGET").unwrap_or_default();
    if !target.starts_with("thumb") {
        return;
    }

    fs::copy("memory.x", out_dir.join("memory.x")).expect("memory.x at the crate root");
    println!("cargo:rustc-link-search={}", out_dir.display());
}

fn parse_sec1_hex(hex: &str) -> Result<Vec<u8>, String> {
    if !hex.is_ascii() {
        return Err("non-ASCII characters".into());
    }
    if hex.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", hex.len()));
    }
    let key = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|err| format!("at {}: {}", i, err)))
        .collect::<Result<Vec<u8>, String>>()?;
    match (key.len(), key.first().copied()) {
        (33, Some(0x02 | 0x03)) | (65, Some(0x04)) => Ok(key),
        (len, tag) => Err(format!("not a SEC1 point ({} bytes, tag {:?})", len, tag)),
    }
}
