//! Credential-less access to public `http://` and `https://` links.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::link_creds::{Creds, LinkedStorage, ProviderFactory, ProviderKind};

/// Fetches public web resources with a blocking client.
#[derive(Clone, Debug)]
pub struct HttpStorage {
    client: reqwest::blocking::Client,
}

impl HttpStorage {
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tensorchunk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Config(format!("cannot build http client: {e}")))?;
        Ok(Self { client })
    }
}

impl LinkedStorage for HttpStorage {
    fn get_bytes(&self, path: &str) -> EngineResult<Vec<u8>> {
        let failed = |reason: String| EngineError::LinkVerification {
            path: path.to_string(),
            reason,
        };
        let response = self
            .client
            .get(path)
            .send()
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("server answered {status}")));
        }
        let body = response.bytes().map_err(|e| failed(e.to_string()))?;
        debug!(url = path, bytes = body.len(), "link fetched");
        Ok(body.to_vec())
    }

    /// Public URLs are used as they are.
    fn presigned_url(&self, path: &str, _full: bool) -> EngineResult<String> {
        Ok(path.to_string())
    }
}

/// Factory for public web data. Object stores (`s3://`, `gcs://`) need a
/// factory that carries their clients.
#[derive(Clone, Debug)]
pub struct HttpFactory {
    storage: Arc<HttpStorage>,
}

impl HttpFactory {
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        Ok(Self {
            storage: Arc::new(HttpStorage::new(timeout)?),
        })
    }
}

impl ProviderFactory for HttpFactory {
    fn build(
        &self,
        kind: ProviderKind,
        _creds_key: Option<&str>,
        _creds: &Creds,
    ) -> EngineResult<Arc<dyn LinkedStorage>> {
        match kind {
            ProviderKind::Http => Ok(self.storage.clone()),
            other => Err(EngineError::UnsupportedProvider(other.to_string())),
        }
    }
}
