//! Regional blob storage layer.
//!
//! Streams validated origin bytes into one S3 bucket per region with
//! chunked multipart uploads, owns the bucket lifecycle policy that expires
//! mirrored objects and abandoned multipart parts, and constructs the
//! public read-through URL clients are redirected to.

pub mod s3;

pub use s3::BlobStore;
