//! Bakes `.env` settings into the firmware image.

/// Seconds between periodic flushes when `.env` does not say otherwise
const DEFAULT_FLUSH_INTERVAL_SECS: &str = "600";

fn main() {
    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rerun-if-env-changed=FLUSH_INTERVAL_SECS");
    let _ = dotenvy::dotenv();

    let interval = std::env::var("FLUSH_INTERVAL_SECS")
        .unwrap_or_else(|_| DEFAULT_FLUSH_INTERVAL_SECS.to_string());
    if interval.parse::<u32>().is_err() {
        panic!("FLUSH_INTERVAL_SECS must be a whole number of seconds, got `{interval}`");
    }
    println!("cargo:rustc-env=FLUSH_INTERVAL_SECS={interval}");
}
