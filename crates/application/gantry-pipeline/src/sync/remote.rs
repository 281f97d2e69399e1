use async_trait::async_trait;
use serde::de::DeserializeOwned;

use gantry_core::formats::decode_body;
use gantry_core::{AppVersion, ContentSummary, DiffSummary, VersionId};
use gantry_infra::cancel::CancelScope;
use gantry_infra::net::broker::{EndpointSet, RequestBroker};

use crate::sync::SyncError;

/// Read-only view of the distribution service for one application.
///
/// All methods resolve through the endpoint race; bodies may be bare JSON
/// or the legacy status envelope.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Id of the newest published version, `None` when nothing has been
    /// published yet.
    async fn latest_version_id(
        &self,
        scope: &CancelScope,
    ) -> Result<Option<VersionId>, SyncError>;

    /// Full metadata of the newest published version, `None` when nothing
    /// has been published yet.
    async fn latest_version(
        &self,
        scope: &CancelScope,
    ) -> Result<Option<AppVersion>, SyncError>;

    async fn version(&self, id: VersionId, scope: &CancelScope)
        -> Result<AppVersion, SyncError>;

    async fn versions(&self, scope: &CancelScope) -> Result<Vec<AppVersion>, SyncError>;

    async fn content_summary(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<ContentSummary, SyncError>;

    async fn diff_summary(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<DiffSummary, SyncError>;

    /// Download locations for the full content package, in preference order.
    async fn content_urls(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<Vec<String>, SyncError>;

    /// Download locations for the diff package of `id` against `id - 1`.
    async fn diff_urls(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<Vec<String>, SyncError>;

    async fn content_torrent_url(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<String, SyncError>;

    async fn diff_torrent_url(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<String, SyncError>;
}

/// HTTP implementation resolving `apps/{secret}/versions...` resources
/// through a [`RequestBroker`].
pub struct HttpRemoteApi {
    broker: RequestBroker,
    secret: String,
}

impl HttpRemoteApi {
    pub fn new(broker: RequestBroker, secret: impl Into<String>) -> Self {
        Self {
            broker,
            secret: secret.into(),
        }
    }

    pub fn from_client(
        client: reqwest::Client,
        endpoints: EndpointSet,
        secret: impl Into<String>,
    ) -> Self {
        Self::new(RequestBroker::new(client, endpoints), secret)
    }

    fn resource(&self, suffix: &str) -> String {
        format!("apps/{}/versions{suffix}", self.secret)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        suffix: &str,
        scope: &CancelScope,
    ) -> Result<T, SyncError> {
        let resource = self.resource(suffix);
        let body = self.broker.fetch(&resource, scope).await?;
        decode_body(&body).map_err(|e| SyncError::Api(format!("{resource}: {e}")))
    }

    async fn get_text(&self, suffix: &str, scope: &CancelScope) -> Result<String, SyncError> {
        let body = self.broker.fetch(&self.resource(suffix), scope).await?;
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn latest_version_id(
        &self,
        scope: &CancelScope,
    ) -> Result<Option<VersionId>, SyncError> {
        let resource = self.resource("/latest/id");
        let body = self.broker.fetch(&resource, scope).await?;
        let trimmed = body.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(None);
        }
        let id: i64 =
            decode_body(trimmed).map_err(|e| SyncError::Api(format!("{resource}: {e}")))?;
        if id <= 0 {
            return Ok(None);
        }
        u32::try_from(id)
            .map(Some)
            .map_err(|_| SyncError::Api(format!("{resource}: version id {id} out of range")))
    }

    async fn latest_version(
        &self,
        scope: &CancelScope,
    ) -> Result<Option<AppVersion>, SyncError> {
        let resource = self.resource("/latest");
        let body = self.broker.fetch(&resource, scope).await?;
        let trimmed = body.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(None);
        }
        let version: AppVersion =
            decode_body(trimmed).map_err(|e| SyncError::Api(format!("{resource}: {e}")))?;
        Ok((version.id != 0).then_some(version))
    }

    async fn version(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<AppVersion, SyncError> {
        self.get_json(&format!("/{id}"), scope).await
    }

    async fn versions(&self, scope: &CancelScope) -> Result<Vec<AppVersion>, SyncError> {
        self.get_json("", scope).await
    }

    async fn content_summary(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<ContentSummary, SyncError> {
        self.get_json(&format!("/{id}/content_summary"), scope).await
    }

    async fn diff_summary(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<DiffSummary, SyncError> {
        self.get_json(&format!("/{id}/diff_summary"), scope).await
    }

    async fn content_urls(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<Vec<String>, SyncError> {
        self.get_json(&format!("/{id}/content_urls"), scope).await
    }

    async fn diff_urls(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<Vec<String>, SyncError> {
        self.get_json(&format!("/{id}/diff_urls"), scope).await
    }

    async fn content_torrent_url(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<String, SyncError> {
        self.get_text(&format!("/{id}/content_torrent_url"), scope).await
    }

    async fn diff_torrent_url(
        &self,
        id: VersionId,
        scope: &CancelScope,
    ) -> Result<String, SyncError> {
        self.get_text(&format!("/{id}/diff_torrent_url"), scope).await
    }
}
