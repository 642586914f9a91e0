#![deny(unused_must_use, deprecated)]
#![warn(clippy::pedantic)]

//! A deduplicating, encrypted, compressing backup engine. Maps a local
//! filesystem into content-addressed blobs replicated across object stores,
//! with a SQLite catalog binding files, contents, blobs and locations.

pub mod backup;
pub mod blobpack;
pub mod catalog;
pub mod compress;
pub mod crypto;
pub mod defaults;
pub mod fetch;
pub mod logger;
pub mod paranoia;
pub mod readcache;
pub mod repack;
pub mod replicate;
pub mod storage;

use std::{panic, process};

/// Makes any panic in any task quit the entire application. Corrupted data or a
/// violated catalog invariant must never be silently accepted, so the engine
/// prefers a loud process exit over carrying on (https://stackoverflow.com/a/36031130).
pub fn install_panic_exit_hook() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(1);
    }));
}
