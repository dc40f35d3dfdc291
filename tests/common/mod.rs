//! Shared setup for integration tests.
//!
//! `init_tracing()` installs a subscriber once per test binary. Library
//! events only exist with the `tracing` feature; test code can log either way.
//!
//! Environment:
//! - `RUST_LOG`: filter, e.g. `masstree_lite::tree::split=trace` (default `info`)
//! - `MASSTREE_LOG_DIR`: where `masstree-lite.jsonl` goes (default `logs/`)
//! - `MASSTREE_LOG_CONSOLE=0`: file output only
//!
//! The file holds one JSON object per line:
//!
//! ```bash
//! jq 'select(.fields.message == "border split")' logs/masstree-lite.jsonl
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

const LOG_FILE: &str = "masstree-lite.jsonl";

/// Install the test subscriber. Later calls do nothing.
pub fn init_tracing() {
    INIT.call_once(install);
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Append mode: test runners may start one process per test.
fn open_log_file() -> Option<File> {
    let dir: PathBuf = env::var("MASSTREE_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from);

    std::fs::create_dir_all(&dir).ok()?;
    OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE)).ok()
}

fn install() {
    let console_enabled: bool = !env::var("MASSTREE_LOG_CONSOLE").is_ok_and(|v| v == "0");

    let console = console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .with_filter(filter())
    });

    let file = open_log_file().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .json()
            .with_filter(filter())
    });

    // Another harness may already own the global subscriber.
    let _ = Registry::default().with(console).with(file).try_init();
}
