use std::env;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::frame::Camera;

/// Blob layout: `{device_id}/{YYYY}/{MM}/{DD}/{camera}_{HHMMSS}_{epoch-ms}.jpg`.
pub fn blob_name(device_id: &str, camera: Camera, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}_{}_{}.jpg",
        device_id,
        timestamp.format("%Y/%m/%d"),
        camera,
        timestamp.format("%H%M%S"),
        timestamp.timestamp_millis()
    )
}

#[derive(Debug, Clone)]
pub struct PhotoMetadata {
    pub device_id: String,
    pub camera_type: String,
    pub timestamp: DateTime<Utc>,
}

/// One row per persisted image in the analytics table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhotoRecord {
    pub device_id: String,
    pub camera_type: String,
    pub timestamp: DateTime<Utc>,
    pub blob_url: String,
    pub total_blocks: u32,
    pub file_size: usize,
    pub ingestion_time: DateTime<Utc>,
}

/// Where completed images go. Returns the stored object's URL, or `None` when
/// the upload failed.
pub trait ObjectStore: Send + Sync {
    fn put(&self, blob_name: &str, bytes: &[u8], metadata: &PhotoMetadata) -> Option<String>;
}

/// Where per-image rows go once the object upload succeeded.
pub trait AnalyticsStore: Send + Sync {
    fn insert_row(&self, record: &PhotoRecord) -> bool;
}

/// Block-blob uploads over plain HTTPS. The connection string must carry the
/// blob endpoint and, unless the container accepts anonymous writes, a shared
/// access signature (`BlobEndpoint=...;SharedAccessSignature=...`).
pub struct BlobStore {
    endpoint: String,
    container: String,
    sas: Option<String>,
    agent: ureq::Agent,
}

impl BlobStore {
    pub fn from_env() -> Result<Self> {
        let connection_string = env::var("BLOB_STORAGE_CONNECTION_STRING")
            .context("BLOB_STORAGE_CONNECTION_STRING not defined")?;
        let container = env::var("BLOB_CONTAINER_NAME").unwrap_or_else(|_| "photos".to_owned());
        Self::new(&connection_string, container)
    }

    pub fn new(connection_string: &str, container: String) -> Result<Self> {
        let mut endpoint = None;
        let mut account = None;
        let mut suffix = "core.windows.net".to_owned();
        let mut sas = None;

        for field in connection_string.split(';') {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "BlobEndpoint" => endpoint = Some(value.trim_end_matches('/').to_owned()),
                "AccountName" => account = Some(value.to_owned()),
                "EndpointSuffix" => suffix = value.to_owned(),
                "SharedAccessSignature" => {
                    // the rest of the field is the query string, including any '='
                    let start = field.find('=').unwrap_or(0) + 1;
                    sas = Some(field[start..].to_owned());
                }
                _ => {}
            }
        }

        let endpoint = match (endpoint, account) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!("https://{account}.blob.{suffix}"),
            (None, None) => bail!("connection string has neither BlobEndpoint nor AccountName"),
        };

        Ok(BlobStore {
            endpoint,
            container,
            sas,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
        })
    }
}

impl ObjectStore for BlobStore {
    fn put(&self, blob_name: &str, bytes: &[u8], metadata: &PhotoMetadata) -> Option<String> {
        let url = format!("{}/{}/{}", self.endpoint, self.container, blob_name);
        let upload_url = match &self.sas {
            Some(sas) => format!("{url}?{sas}"),
            None => url.clone(),
        };

        let result = self
            .agent
            .put(&upload_url)
            .set("x-ms-blob-type", "BlockBlob")
            .set("Content-Type", "image/jpeg")
            .set("x-ms-meta-device_id", &metadata.device_id)
            .set("x-ms-meta-camera_type", &metadata.camera_type)
            .set("x-ms-meta-timestamp", &metadata.timestamp.to_rfc3339())
            .send_bytes(bytes);

        match result {
            Ok(_) => {
                info!("uploaded blob({url}) size({})", bytes.len());
                Some(url)
            }
            Err(e) => {
                error!("blob upload failed for {url}: {e}");
                None
            }
        }
    }
}

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Streaming ingestion into a columnar analytics cluster, authenticated with
/// client credentials against the tenant's token endpoint.
pub struct IngestStore {
    cluster_uri: String,
    database: String,
    table: String,
    client_id: String,
    client_secret: String,
    tenant_id: String,
    token: Mutex<Option<CachedToken>>,
    agent: ureq::Agent,
}

impl IngestStore {
    pub fn from_env() -> Result<Self> {
        let require = |name: &str| env::var(name).with_context(|| format!("{name} not defined"));

        Ok(IngestStore {
            cluster_uri: require("ADX_CLUSTER_URI")?.trim_end_matches('/').to_owned(),
            database: require("ADX_DATABASE")?,
            table: env::var("ADX_TABLE").unwrap_or_else(|_| "Photos".to_owned()),
            client_id: require("ADX_CLIENT_ID")?,
            client_secret: require("ADX_CLIENT_SECRET")?,
            tenant_id: require("ADX_TENANT_ID")?,
            token: Mutex::new(None),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
        })
    }

    fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().expect("token lock poisoned");

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let token_url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        );
        let scope = format!("{}/.default", self.cluster_uri);

        let response: TokenResponse = self
            .agent
            .post(&token_url)
            .send_form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("scope", &scope),
            ])
            .context("token request failed")?
            .into_json()
            .context("unable to parse token response")?;

        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });

        Ok(response.access_token)
    }
}

impl AnalyticsStore for IngestStore {
    fn insert_row(&self, record: &PhotoRecord) -> bool {
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => {
                error!("unable to obtain ingestion token: {e:#}");
                return false;
            }
        };

        let url = format!(
            "{}/v1/rest/ingest/{}/{}?streamFormat=JSON",
            self.cluster_uri, self.database, self.table
        );

        match self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {token}"))
            .send_json(record)
        {
            Ok(_) => {
                info!(
                    "ingested row for device({}) blob({})",
                    record.device_id, record.blob_url
                );
                true
            }
            Err(e) => {
                error!("row ingestion failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn blob_name_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(100);
        let name = blob_name("dev-1", Camera::Front, ts);
        assert_eq!(name, "dev-1/2024/01/01/CAMAV_120000_1704110400100.jpg");
    }

    #[test]
    fn connection_string_with_endpoint_and_sas() {
        let store = BlobStore::new(
            "BlobEndpoint=https://acct.blob.core.windows.net/;SharedAccessSignature=sv=2024&sig=x",
            "photos".to_owned(),
        )
        .expect("Unable to parse connection string");
        assert_eq!(store.endpoint, "https://acct.blob.core.windows.net");
        assert_eq!(store.sas.as_deref(), Some("sv=2024&sig=x"));
    }

    #[test]
    fn connection_string_with_account_name() {
        let store = BlobStore::new(
            "AccountName=acct;AccountKey=secret;EndpointSuffix=core.windows.net",
            "photos".to_owned(),
        )
        .expect("Unable to parse connection string");
        assert_eq!(store.endpoint, "https://acct.blob.core.windows.net");
        assert!(store.sas.is_none());
    }

    #[test]
    fn connection_string_without_endpoint_is_rejected() {
        assert!(BlobStore::new("AccountKey=secret", "photos".to_owned()).is_err());
    }

    #[test]
    fn record_serializes_with_pascal_case_columns() {
        let record = PhotoRecord {
            device_id: "dev-1".to_owned(),
            camera_type: "CAMAV".to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            blob_url: "https://example/blob.jpg".to_owned(),
            total_blocks: 3,
            file_size: 6,
            ingestion_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap(),
        };

        let json = serde_json::to_value(&record).expect("Unable to serialize record");
        assert_eq!(json["DeviceId"], "dev-1");
        assert_eq!(json["CameraType"], "CAMAV");
        assert_eq!(json["TotalBlocks"], 3);
        assert_eq!(json["FileSize"], 6);
        assert!(json["BlobUrl"].is_string());
        assert!(json["IngestionTime"].is_string());
    }
}
