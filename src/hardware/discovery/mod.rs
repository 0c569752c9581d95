//! Hardware Discovery Module
//!
//! Enumerates block devices from sysfs and reports additions, removals and
//! attribute changes as observations.

pub mod scanner;
pub mod watcher;

pub use scanner::*;
pub use watcher::*;
