fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Release builds stamp the commit they were built from.
    println!("cargo:rerun-if-env-changed=WAYPOINT_GIT_HASH");
    if let Ok(hash) = std::env::var("WAYPOINT_GIT_HASH") {
        println!("cargo:rustc-env=WAYPOINT_GIT_HASH={}", hash);
    }
}
