//! Realtime database REST transport.
//!
//! - `GET {base}/{root}.json` reads the document (`null` when absent)
//! - `PUT {base}/{root}.json` overwrites it
//! - `PATCH {base}/.json` with `{root}/{path}` keys is a multi-path update

use super::{RemoteError, RemoteStore};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value};
use tally_engine::{Document, PathPatch};

/// Remote store backed by the realtime database REST API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    root: String,
    auth: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, root: impl Into<String>, auth: Option<String>) -> Self {
        Self::with_client(Client::new(), base_url, root, auth)
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        root: impl Into<String>,
        auth: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            root: root.into().trim_matches('/').to_string(),
            auth,
        }
    }

    fn document_url(&self) -> String {
        format!("{}/{}.json", self.base_url, self.root)
    }

    fn root_url(&self) -> String {
        format!("{}/.json", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(token) => request.query(&[("auth", token)]),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl RemoteStore for HttpRemote {
    async fn read_document(&self) -> Result<Option<Value>, RemoteError> {
        let response = self.send(self.client.get(self.document_url())).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        match serde_json::from_slice(&body) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(RemoteError::Decode(e.to_string())),
        }
    }

    async fn write_document(&self, document: &Document) -> Result<(), RemoteError> {
        let body = serde_json::to_value(document)?;
        self.send(self.client.put(self.document_url()).json(&body))
            .await?;
        tracing::debug!(url = %self.document_url(), "Document written");
        Ok(())
    }

    async fn write_paths(&self, patch: &PathPatch) -> Result<(), RemoteError> {
        if patch.is_empty() {
            return Ok(());
        }
        let body: Map<String, Value> = patch
            .iter()
            .map(|(path, value)| (format!("{}/{}", self.root, path), value.clone()))
            .collect();

        self.send(self.client.patch(self.root_url()).json(&body))
            .await?;
        tracing::debug!(paths = body.len(), "Multi-path update written");
        Ok(())
    }
}
