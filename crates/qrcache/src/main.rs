//! qrcache.
//!
//! Command line front end of the QR image cache. It loads images through the tiered cache and
//! maintains the on-disk cache directory.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
