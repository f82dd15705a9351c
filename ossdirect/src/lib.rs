#![doc = include_str!("../README.md")]

mod api;
mod config;
mod credentials;
mod download;
mod error;
mod finalize;
pub mod http;
mod part;
mod planner;
mod pool;
mod retry;
mod source;
mod upload;

pub use api::ObjectDetails;
pub use config::Config;
pub use credentials::{AccessTokenProvider, StaticAccessToken};
pub use download::*;
pub use error::{ApiError, BoxedError, OssDirectError, PartFailure, Result};
pub use planner::{chunk_count, plan_chunks, ChunkDescriptor};
pub use source::UploadSource;
pub use upload::*;
