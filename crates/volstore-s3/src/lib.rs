//! S3-compatible remote volumes for volstore.
//!
//! Works against any store speaking the S3 API (Cloudflare R2, MinIO, AWS).
//! Each volume is a key prefix in one bucket, so many volumes can share a
//! bucket.

mod config;
mod volume;

pub use config::S3Config;
pub use volume::{S3Connector, S3Volume};
