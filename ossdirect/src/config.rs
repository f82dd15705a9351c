use crate::Result;
use snafu::prelude::*;
use url::Url;

/// The configuration settings that control the behavior of uploads and downloads.
///
/// A `Config` is passed explicitly to every job; nothing about it is process-wide.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// The base URL of the object store REST API.
    ///
    /// Bucket and object paths are resolved relative to this URL, so it should end with `/`.
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            global = true,
            value_name = "URL",
            default_value = "https://developer.api.autodesk.com/oss/v2/"
        )
    )]
    pub base_url: Url,

    /// The size of each part of a multipart upload.
    ///
    /// Every part except the last is exactly this size.  Can be specified as an integer, ie
    /// "1000000", or with a suffix ie "10MiB".
    ///
    /// Note that the object store rejects completion of an upload whose parts (other than the last
    /// one) are smaller than 5 MiB.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5MiB", global = true))]
    pub chunk_size: byte_unit::Byte,

    /// The maximum number of signed upload URLs requested in a single call.
    #[cfg_attr(feature = "clap", clap(long, default_value = "25", global = true))]
    pub max_batch_size: usize,

    /// The maximum number of attempts to upload any one part before the whole upload is failed.
    ///
    /// Attempts that fail because the signed URL was stale count against this limit too.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5", global = true))]
    pub max_retry: usize,

    /// The maximum number of times a single URL request is repeated after the object store
    /// responds that it's rate limited.
    ///
    /// Waiting for rate limits doesn't count against `max_retry`.
    #[cfg_attr(feature = "clap", clap(long, default_value = "20", global = true))]
    pub max_rate_limit_waits: usize,

    /// Custom expiration of the signed URLs, in minutes (1 to 60).
    ///
    /// If not specified the object store default (2 minutes) applies.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "MINUTES"))]
    pub minutes_expiration: Option<u32>,

    /// Request download URLs that are served from the CDN
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub use_cdn: bool,
}

/// The object store limit on the number of parts in one upload
pub(crate) const MAX_PARTS: usize = 10_000;

/// The object store limit on the size of one part
pub(crate) const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            base_url: "https://developer.api.autodesk.com/oss/v2/"
                .parse()
                .expect("BUG: default base URL is valid"),
            chunk_size: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
            max_batch_size: 25,
            max_retry: 5,
            max_rate_limit_waits: 20,
            minutes_expiration: None,
            use_cdn: false,
        }
    }
}

impl Config {
    /// The chunk size in bytes
    pub(crate) fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size.get_bytes() as u64
    }

    /// Check the settings for values that can't possibly work.
    ///
    /// Every job validates its config before making any requests, so callers don't need to call
    /// this themselves unless they want to fail early.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.chunk_size.get_bytes() > 0,
            crate::error::InvalidConfigSnafu {
                message: "the chunk size must be greater than zero"
            }
        );
        ensure!(
            self.chunk_size.get_bytes() <= MAX_CHUNK_SIZE as u128,
            crate::error::InvalidConfigSnafu {
                message: format!(
                    "the chunk size must be at most {}, not {}",
                    byte_unit::Byte::from_bytes(MAX_CHUNK_SIZE as u128).get_appropriate_unit(true),
                    self.chunk_size.get_appropriate_unit(true)
                )
            }
        );
        ensure!(
            self.max_batch_size > 0,
            crate::error::InvalidConfigSnafu {
                message: "the maximum URL batch size must be at least 1"
            }
        );
        ensure!(
            self.max_retry > 0,
            crate::error::InvalidConfigSnafu {
                message: "the maximum retry count must be at least 1"
            }
        );

        if let Some(minutes) = self.minutes_expiration {
            ensure!(
                (1..=60).contains(&minutes),
                crate::error::InvalidConfigSnafu {
                    message: format!("URL expiration must be 1 to 60 minutes, not {minutes}")
                }
            );
        }

        ensure!(
            !self.base_url.cannot_be_a_base(),
            crate::error::InvalidConfigSnafu {
                message: format!("'{}' can't be used as a base URL", self.base_url)
            }
        );

        Ok(())
    }
}
