pub mod action;
pub mod catalog;
pub mod config;
pub mod report;
pub mod serdable;
pub mod style;
pub mod testing;

pub use crate::catalog::Catalog;
pub use crate::config::Config;
