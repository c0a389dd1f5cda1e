pub mod catalog;
pub mod rg_dealers;

pub use crate::util::db;
