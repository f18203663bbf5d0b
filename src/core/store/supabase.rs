//! Supabase backing store (PostgREST tables + Storage bucket).

use std::time::Duration;

use log::{debug, info};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::config::{ConfigError, StoreConfig};
use crate::core::error::SfotError;
use crate::core::model::{Chunk, ChunkStatus};
use crate::core::store::{BackingStore, ChunkUpdate, DetectionRecord, StoreError, StoredDetection};

const CHUNK_COLUMNS: &str =
    "id,vod_id,start_seconds,end_seconds,status,attempt_count,frames_processed,detections_count,vods(source_id)";

pub struct SupabaseStore {
    client: Client,
    base_url: String,
    bucket: String,
    schema: Option<String>,
}

#[derive(Deserialize)]
struct VodRef {
    source_id: Value,
}

#[derive(Deserialize)]
struct ChunkRow {
    id: Value,
    vod_id: Value,
    start_seconds: u64,
    end_seconds: u64,
    status: ChunkStatus,
    attempt_count: Option<u32>,
    frames_processed: Option<u64>,
    detections_count: Option<u64>,
    vods: Option<VodRef>,
}

impl ChunkRow {
    fn into_chunk(self) -> Chunk {
        let source_id = self
            .vods
            .map(|v| id_string(&v.source_id))
            .unwrap_or_default();
        Chunk {
            id: id_string(&self.id),
            vod_id: id_string(&self.vod_id),
            source_id,
            start_seconds: self.start_seconds,
            end_seconds: self.end_seconds,
            status: self.status,
            attempt_count: self.attempt_count.unwrap_or(0),
            frames_processed: self.frames_processed.unwrap_or(0),
            detections_count: self.detections_count.unwrap_or(0),
        }
    }
}

/// Ids come back as numbers or strings depending on the column type.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SupabaseStore {
    pub fn from_config(config: &StoreConfig) -> Result<Self, SfotError> {
        let url = config.url.as_deref().ok_or(ConfigError::Missing("store.url"))?;
        let key = config
            .secret_key
            .as_deref()
            .ok_or(ConfigError::Missing("store.secret_key"))?;

        let invalid_key = || ConfigError::OutOfRange {
            field: "store.secret_key",
            value: "<redacted>".to_string(),
            expected: "a valid header value",
        };
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(key).map_err(|_| invalid_key())?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| invalid_key())?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(StoreError::from)?;

        info!(
            "🗄️ Supabase store ready (schema: {})",
            config.schema.as_deref().unwrap_or("public")
        );
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            bucket: config.storage_bucket.clone(),
            schema: config.schema.clone(),
        })
    }

    fn table(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.schema {
            Some(schema) => builder
                .header("Accept-Profile", schema)
                .header("Content-Profile", schema),
            None => builder,
        }
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }
}

fn check(response: Response, operation: &'static str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StoreError::Status {
            operation,
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}

impl BackingStore for SupabaseStore {
    fn fetch_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, StoreError> {
        let request = self.client.get(self.rest_url("chunks")).query(&[
            ("id", format!("eq.{chunk_id}")),
            ("select", CHUNK_COLUMNS.to_string()),
        ]);
        let response = check(self.table(request).send()?, "fetch chunk")?;
        let rows: Vec<ChunkRow> = serde_json::from_str(&response.text()?)?;
        Ok(rows.into_iter().next().map(ChunkRow::into_chunk))
    }

    fn list_detections(&self, chunk_id: &str) -> Result<Vec<StoredDetection>, StoreError> {
        let request = self.client.get(self.rest_url("detections")).query(&[
            ("chunk_id", format!("eq.{chunk_id}")),
            ("select", "storage_path".to_string()),
        ]);
        let response = check(self.table(request).send()?, "list detections")?;
        Ok(serde_json::from_str(&response.text()?)?)
    }

    fn delete_detections(&self, chunk_id: &str) -> Result<usize, StoreError> {
        let request = self
            .client
            .delete(self.rest_url("detections"))
            .query(&[
                ("chunk_id", format!("eq.{chunk_id}")),
                ("select", "storage_path".to_string()),
            ])
            .header("Prefer", "return=representation");
        let response = check(self.table(request).send()?, "delete detections")?;
        let deleted: Vec<StoredDetection> = serde_json::from_str(&response.text()?)?;
        Ok(deleted.len())
    }

    fn insert_detections(&self, records: &[DetectionRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .post(self.rest_url("detections"))
            .header("Prefer", "return=minimal")
            .json(records);
        check(self.table(request).send()?, "insert detections")?;
        debug!("📤 inserted {} detections", records.len());
        Ok(())
    }

    fn upload_image(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.object_url(path))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes.to_vec())
            .send()?;
        check(response, "upload image")?;
        Ok(())
    }

    fn delete_images(&self, paths: &[String]) -> Result<(), StoreError> {
        if paths.is_empty() {
            return Ok(());
        }
        let prefixes: Vec<&str> = paths.iter().map(|p| p.trim_start_matches('/')).collect();
        let response = self
            .client
            .delete(format!(
                "{}/storage/v1/object/{}",
                self.base_url, self.bucket
            ))
            .json(&json!({ "prefixes": prefixes }))
            .send()?;
        check(response, "delete images")?;
        Ok(())
    }

    fn update_chunk(&self, chunk_id: &str, update: &ChunkUpdate) -> Result<(), StoreError> {
        let request = self
            .client
            .patch(self.rest_url("chunks"))
            .query(&[("id", format!("eq.{chunk_id}"))])
            .header("Prefer", "return=minimal")
            .json(update);
        check(self.table(request).send()?, "update chunk")?;
        Ok(())
    }
}
