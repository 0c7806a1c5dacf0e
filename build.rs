/// Validates version consistency to prevent version-mismatch builds shipping
/// under a placeholder version string.
fn validate_version() {
    let version = env!("CARGO_PKG_VERSION");

    if version == "0.1.0" {
        panic!(
            "ERROR: Version is set to default 0.1.0\n\
             Please ensure Cargo.toml has the correct version number."
        );
    }
    if version.is_empty() {
        panic!("ERROR: CARGO_PKG_VERSION is empty. Check your build environment.");
    }

    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() < 3 {
        panic!(
            "ERROR: Version '{}' does not follow semantic versioning (major.minor.patch)",
            version
        );
    }
    for (i, part) in parts.iter().take(3).enumerate() {
        if part.parse::<u32>().is_err() {
            panic!(
                "ERROR: Version component '{}' at position {} is not a valid number (version: {})",
                part, i, version
            );
        }
    }

    println!("cargo:rustc-env=CITRINE_BUILD_VERSION={}", version);
    println!("cargo:rerun-if-changed=Cargo.toml");
}

fn main() {
    validate_version();
}
