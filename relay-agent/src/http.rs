//! Outbound HTTP calls the Agent makes against the Controller's RelayHTTP
//! endpoints (§4.5), the push side of `mosaicfs-server/src/handlers/files.rs`'s
//! Range-serving pattern — here `reqwest` plays the client `mosaicfs-agent`
//! elsewhere reserves for the Control Plane.

use std::path::Path;

use relay_common::credential::credential;
use reqwest::multipart;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::ControllerAddress;

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    instance_name: String,
    controller: ControllerAddress,
}

impl ControllerClient {
    pub fn new(controller: ControllerAddress, instance_name: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(controller.ignore_certificate_errors)
            .build()?;
        let base_url = format!("https://{}", controller.address);
        Ok(Self { http, base_url, instance_name, controller })
    }

    fn credential_for(&self, token: Uuid) -> String {
        credential(self.controller.secret.as_bytes(), &self.instance_name, &token.to_string())
    }

    /// `POST /shares/{token}` — multipart `{shares: JSON, database: file}`.
    pub async fn upload_shares(&self, token: Uuid, shares_json: String, database_path: &Path) -> anyhow::Result<()> {
        let database_bytes = tokio::fs::read(database_path).await?;
        let form = multipart::Form::new()
            .text("shares", shares_json)
            .part("database", multipart::Part::bytes(database_bytes).file_name("catalog.db"));

        let response = self
            .http
            .post(format!("{}/shares/{}", self.base_url, token))
            .header("X-API-Key", &self.controller.api_key)
            .header("X-Relay-Agent", &self.instance_name)
            .header("X-Relay-Credential", self.credential_for(token))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("share upload rejected: {}", response.status());
        }
        Ok(())
    }

    /// `POST /files/{token}` — streams `local_path` from `start_offset` as
    /// the multipart file part, never buffering the whole file (§4.6(c)/(d)).
    pub async fn upload_file(
        &self,
        token: Uuid,
        virtual_filename: &str,
        local_path: &Path,
        start_offset: u64,
    ) -> anyhow::Result<()> {
        use tokio::io::{AsyncSeekExt, SeekFrom};

        let mut file = File::open(local_path).await?;
        if start_offset > 0 {
            file.seek(SeekFrom::Start(start_offset)).await?;
        }
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        let file_name = virtual_filename.rsplit('/').next().unwrap_or(virtual_filename).to_string();
        let form = multipart::Form::new().part("file", multipart::Part::stream(body).file_name(file_name));

        let response = self
            .http
            .post(format!("{}/files/{}", self.base_url, token))
            .header("X-API-Key", &self.controller.api_key)
            .header("X-Relay-Agent", &self.instance_name)
            .header("X-Relay-Credential", self.credential_for(token))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("file upload rejected: {}", response.status());
        }
        Ok(())
    }

    /// `GET /downloads/{token}` — pull a pushed download into `dest`.
    pub async fn download_file(&self, token: Uuid, virtual_filename: &str, dest: &Path) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        let filename_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, virtual_filename);
        let response = self
            .http
            .get(format!("{}/downloads/{}", self.base_url, token))
            .header("X-API-Key", &self.controller.api_key)
            .header("X-Relay-Agent", &self.instance_name)
            .header("X-Relay-Credential", self.credential_for(token))
            .header("X-Relay-Filename-Base64", filename_b64)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("download pull rejected: {}", response.status());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        Ok(())
    }
}
