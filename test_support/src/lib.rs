//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Common test fixtures for all dbexporter crates

use std::io::Write;

/// Write `contents` to a fresh temporary file ending in `suffix`
///
/// The file is removed when the returned handle is dropped, so keep it alive
/// for as long as the test reads from its path.
pub fn write_temp_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("dbexporter-test-")
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(contents.as_bytes())
        .expect("write temp file");
    file.flush().expect("flush temp file");
    file
}

/// Route tracing output through the test harness so it shows up on failure
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
