//! Bitmill.
//!
//! Loads images through the bitmill engine from the command line, and maintains its disk cache.

#![warn(missing_debug_implementations, clippy::all)]

mod cleanup;
mod cli;
mod load;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            bitmill_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
