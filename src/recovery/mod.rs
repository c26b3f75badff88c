//! Index-bypass recovery: reconstruct a file list from a TAR stream without
//! trusting (or even having) a `SqliteIndex`, kept from the teacher's
//! `recovery::scanner` and retargeted at TAR block/header scanning —
//! spec.md §7's tier-2 "truncated TAR: keep what parsed" policy, applied as
//! a standalone diagnostic rather than folded into `TarIndexer` itself.

pub mod scanner;

pub use scanner::{
    extract_recoverable, scan, scan_file, BlockHealth, RecoveryQuality, RecoveryReport, ScannedBlock,
};
