pub mod batch;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod copier;
pub mod error;
pub mod fetcher;
pub mod image;
pub mod manifest;
pub mod mint;
pub mod pool;
pub mod registry;
pub mod report;
pub mod retry;
pub mod store;
pub mod sync;
pub mod synchronizers;
