//! Channel catalog: provisioning, listing and navigation

pub mod catalog;

pub use catalog::{CatalogChange, CatalogWatch, Channel, ChannelCatalog, Direction};
