//! Remote (S3/GCS-style) table storage over HTTP range reads.
//!
//! Table files are immutable once written, so a remote backend only ever
//! needs `PUT` (whole object) and ranged `GET`; there is no append or
//! partial-write story to build. Uses `hyper` directly for the
//! client/connection pool rather than pulling in a higher-level HTTP crate.

use std::sync::Arc;

use anyhow::{Context, Error};
use hyper::body::HttpBody;
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Method, Request, StatusCode};
use log::debug;

use crate::hash::Address;
use crate::runtime::RuntimeContext;
use crate::table::TableSpec;

use super::{ChunkSource, Persister};

/// Minimal S3/GCS-compatible object storage client: a base URL per table
/// (`{endpoint}/{bucket}/{prefix}/{hex name}`) and plain bearer auth, which
/// covers both AWS S3 (presigned or IAM-proxied) and GCS's S3-interop API.
pub struct RemotePersister {
    endpoint: url::Url,
    bearer_token: Option<String>,
    client: Client<HttpConnector>,
    runtime: RuntimeContext,
}

impl RemotePersister {
    pub fn new(endpoint: url::Url, bearer_token: Option<String>, runtime: RuntimeContext) -> Self {
        RemotePersister {
            endpoint,
            bearer_token,
            client: Client::new(),
            runtime,
        }
    }

    fn object_url(&self, name: Address) -> url::Url {
        self.endpoint
            .join(&name.to_hex())
            .expect("table hex name is always a valid URL segment")
    }

    fn request(&self, method: Method, name: Address) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(self.object_url(name).as_str());
        if let Some(token) = &self.bearer_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request has no invalid headers")
    }
}

impl Persister for RemotePersister {
    fn persist_table(&self, spec: TableSpec, image: &[u8]) -> Result<(), Error> {
        let mut req = self.request(Method::PUT, spec.name);
        *req.body_mut() = Body::from(image.to_vec());
        let client = self.client.clone();
        let resp = self
            .runtime
            .block_on(async move { client.request(req).await })
            .with_context(|| format!("PUT table {}", spec.name))?;
        if !resp.status().is_success() {
            anyhow::bail!("PUT table {} failed: {}", spec.name, resp.status());
        }
        debug!("persisted table {} ({} bytes) to remote store", spec.name, image.len());
        Ok(())
    }

    fn delete_tables(&self, names: &[Address]) -> Result<(), Error> {
        for &name in names {
            let req = self.request(Method::DELETE, name);
            let client = self.client.clone();
            let resp = self
                .runtime
                .block_on(async move { client.request(req).await })
                .with_context(|| format!("DELETE table {}", name))?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                anyhow::bail!("DELETE table {} failed: {}", name, resp.status());
            }
        }
        Ok(())
    }

    fn table_exists(&self, name: Address) -> Result<bool, Error> {
        let req = self.request(Method::HEAD, name);
        let client = self.client.clone();
        let resp = self
            .runtime
            .block_on(async move { client.request(req).await })
            .with_context(|| format!("HEAD table {}", name))?;
        Ok(resp.status().is_success())
    }

    fn source(&self) -> Arc<dyn ChunkSource> {
        Arc::new(RemoteChunkSource {
            endpoint: self.endpoint.clone(),
            bearer_token: self.bearer_token.clone(),
            client: self.client.clone(),
            runtime: self.runtime.clone(),
        })
    }
}

pub struct RemoteChunkSource {
    endpoint: url::Url,
    bearer_token: Option<String>,
    client: Client<HttpConnector>,
    runtime: RuntimeContext,
}

impl RemoteChunkSource {
    fn object_url(&self, name: Address) -> url::Url {
        self.endpoint
            .join(&name.to_hex())
            .expect("table hex name is always a valid URL segment")
    }

    fn ranged_get(&self, name: Address, range_header: String) -> Result<Vec<u8>, Error> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(self.object_url(name).as_str())
            .header("Range", range_header);
        if let Some(token) = &self.bearer_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let req = builder.body(Body::empty())?;
        let client = self.client.clone();
        let body = self.runtime.block_on(async move {
            let mut resp = client.request(req).await?;
            if !(resp.status().is_success() || resp.status() == StatusCode::PARTIAL_CONTENT) {
                anyhow::bail!("range GET failed: {}", resp.status());
            }
            let mut buf = Vec::new();
            while let Some(chunk) = resp.body_mut().data().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok::<_, Error>(buf)
        })?;
        Ok(body)
    }
}

impl ChunkSource for RemoteChunkSource {
    fn table_len(&self, name: Address) -> Result<u64, Error> {
        let req = Request::builder()
            .method(Method::HEAD)
            .uri(self.object_url(name).as_str())
            .body(Body::empty())?;
        let client = self.client.clone();
        let resp = self
            .runtime
            .block_on(async move { client.request(req).await })
            .with_context(|| format!("HEAD table {}", name))?;
        let len = resp
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("table {} HEAD response missing Content-Length", name))?;
        Ok(len)
    }

    fn read_tail(&self, name: Address, len: u64) -> Result<Vec<u8>, Error> {
        // Negative-offset suffix range, per RFC 7233 §2.1: fetch the last
        // `len` bytes without needing to know the object size up front.
        self.ranged_get(name, format!("bytes=-{len}"))
    }

    fn read_range(&self, name: Address, offset: u64, len: u32) -> Result<Vec<u8>, Error> {
        let last = offset + len as u64 - 1;
        self.ranged_get(name, format!("bytes={offset}-{last}"))
    }
}
