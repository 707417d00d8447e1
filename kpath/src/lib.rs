pub mod cache;
pub mod config;
pub mod kprobe;
pub mod resolver;
pub mod store;
pub mod util;

pub use kpath_common::path;
