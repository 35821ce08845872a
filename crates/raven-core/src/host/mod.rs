//! Local implementations of the host capability traits

mod fs;
mod terminals;

pub use fs::LocalFileSystem;
pub use terminals::LocalTerminalManager;
