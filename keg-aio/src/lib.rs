// keg-aio/src/lib.rs
//! Primitive IO operations for keg: checksums, subprocesses, atomic writes,
//! JSON files, archive extraction and manifest removal.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod json_io;
pub mod process;
pub mod uninstall;

pub use checksum::{sha256_hex, verify_bytes, verify_checksum_async, verify_checksum_sync};
pub use extract::extract_archive;
pub use json_io::{read_json_sync, write_json_sync};
pub use process::{run_command_captured, CapturedOutput};
pub use uninstall::remove_manifest;
