//! Blobmirror.
//!
//! Blobmirror is a standalone web service that mirrors a remote object store
//! over HTTP. It is a read-through cache intended for software-update
//! distribution: few keys, large binary blobs, and a high read ratio. Objects
//! are downloaded once, streamed to all concurrent clients while the
//! download is still running, and afterwards served from local disk until
//! they expire or get evicted.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
