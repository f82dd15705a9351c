//! Access tokens for the object store REST API.
//!
//! Every API call (URL issuance, completion) carries a bearer token.  The token is obtained from
//! an [`AccessTokenProvider`] immediately before each call, so long-running transfers keep working
//! across token refreshes as long as the provider hands out fresh tokens.  The signed URLs
//! themselves are self-authorizing and never get a token attached.
use crate::error::BoxedError;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;

/// A source of bearer tokens for the object store API.
///
/// This is not called for each part transfer, only for the API calls that issue signed URLs or
/// complete an upload.
pub trait AccessTokenProvider: Debug + Send + Sync {
    fn access_token(&self) -> BoxFuture<'_, std::result::Result<String, BoxedError>>;
}

/// A token provider which always returns the same token.
///
/// Suitable for short transfers, or for tests.  The token is never printed in debug output.
#[derive(Clone)]
pub struct StaticAccessToken(Arc<str>);

impl StaticAccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }
}

impl Debug for StaticAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticAccessToken").field(&"<redacted>").finish()
    }
}

impl AccessTokenProvider for StaticAccessToken {
    fn access_token(&self) -> BoxFuture<'_, std::result::Result<String, BoxedError>> {
        let token = self.0.to_string();
        Box::pin(async move { Ok(token) })
    }
}

/// Cheaply cloneable handle to whatever token provider the caller supplied
pub(crate) type SharedTokenProvider = Arc<dyn AccessTokenProvider>;
