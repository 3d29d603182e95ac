//! Helpers for testing the engine and the CLI.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk cache silently recreates the
//!    directory, which then leaks. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{ImageFormat, Rgba, RgbaImage};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the bitmill crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("bitmill_service=trace,bitmill=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A deterministic test image: a diagonal gradient with an opaque red top-left pixel.
pub fn image(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        if x == 0 && y == 0 {
            return Rgba([255, 0, 0, 255]);
        }
        let value = ((x + y) * 255 / (width + height).max(1)) as u8;
        Rgba([value, value, 255 - value, 255])
    })
}

/// [`image`] encoded as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image(width, height)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Writes [`png_bytes`] to `name` within `dir`, returning the full path.
pub fn write_png(dir: impl AsRef<Path>, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.as_ref().join(name);
    std::fs::write(&path, png_bytes(width, height)).unwrap();
    path
}
