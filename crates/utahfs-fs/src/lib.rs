//! UtahFS file layer.
//!
//! [`BlockFilesystem`] stores each file as a skip list of fixed-size data
//! nodes kept in [`utahfs_persistent::AppStorage`], so reads and writes at
//! any offset reach their node in a logarithmic number of hops.

pub mod error;
pub mod filesystem;

pub use error::{FsError, FsResult};
pub use filesystem::{BlockFilesystem, MAX_PTRS};
