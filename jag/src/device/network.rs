//! Devices (and UART proxies) reached over HTTP.

use std::collections::BTreeMap;
use std::time::Duration;

use jag_proto::{CodeKind, upload};
use tracing::debug;
use ureq::Agent;

use super::PushOptions;
use crate::http::{
    self, CONTAINER_NAME_HEADER, CONTAINER_TIMEOUT_HEADER, CRC32_HEADER, DEVICE_ID_HEADER,
    DISABLED_HEADER, Reply, SDK_VERSION_HEADER,
};
use crate::identity::DeviceIdentity;
use crate::{Error, Result};

/// HTTP client bound to one device.
#[derive(Debug, Clone)]
pub struct NetworkDevice {
    identity: DeviceIdentity,
    base: String,
    agent: Agent,
}

impl NetworkDevice {
    /// Creates a client for `identity.address`.
    pub fn new(identity: DeviceIdentity, timeout: Duration) -> Self {
        Self {
            base: http::base_url(&identity.address),
            agent: http::agent(timeout),
            identity,
        }
    }

    pub(super) const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub(super) async fn ping(&self) -> Result<()> {
        self.get("ping").await.map(drop)
    }

    pub(super) async fn send_code(
        &self,
        kind: CodeKind,
        image: &[u8],
        options: &PushOptions,
    ) -> Result<()> {
        let name = options.install_name(kind)?;
        let mut headers = self.id_header();
        if !options.sdk_version.is_empty() {
            headers.push((SDK_VERSION_HEADER, options.sdk_version.clone()));
        }
        headers.push((CRC32_HEADER, upload::crc32(image).to_string()));
        if let Some(name) = name {
            headers.push((CONTAINER_NAME_HEADER, name.to_owned()));
        }
        if options.disabled {
            headers.push((DISABLED_HEADER, "true".to_owned()));
        }
        if let Some(timeout) = options.timeout {
            headers.push((CONTAINER_TIMEOUT_HEADER, timeout.as_secs().to_string()));
        }
        // Remaining defines have no header of their own.
        if !options.defines.is_empty() {
            debug!(count = options.defines.len(), "extra defines are not sent over HTTP");
        }
        let path = match kind {
            CodeKind::Run => "run",
            CodeKind::Install => "install",
        };
        self.put(path, headers, image.to_vec())
            .await
            .map_err(|e| self.explain(e, &options.sdk_version))
    }

    pub(super) async fn container_list(&self) -> Result<BTreeMap<String, String>> {
        let body = self.get("list").await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub(super) async fn container_uninstall(&self, name: &str) -> Result<()> {
        let mut headers = self.id_header();
        headers.push((CONTAINER_NAME_HEADER, name.to_owned()));
        self.put("uninstall", headers, Vec::new()).await
    }

    pub(super) async fn update_firmware(&self, image: &[u8]) -> Result<()> {
        self.put("firmware", self.id_header(), image.to_vec()).await
    }

    fn id_header(&self) -> Vec<(&'static str, String)> {
        vec![(DEVICE_ID_HEADER, self.identity.id.clone())]
    }

    /// Fills in the device side of a version mismatch.
    fn explain(&self, err: Error, image_sdk: &str) -> Error {
        match err {
            Error::SdkVersionMismatch { .. } => Error::SdkVersionMismatch {
                device: self.identity.sdk_version.clone(),
                image: image_sdk.to_owned(),
            },
            other => other,
        }
    }

    async fn get(&self, path: &'static str) -> Result<Vec<u8>> {
        let agent = self.agent.clone();
        let url = format!("{}/{path}", self.base);
        let headers = self.id_header();
        let reply = http::blocking(move || http::get(&agent, &url, &headers)).await?;
        self.check(path, reply)
    }

    async fn put(
        &self,
        path: &'static str,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    ) -> Result<()> {
        let agent = self.agent.clone();
        let url = format!("{}/{path}", self.base);
        let reply = http::blocking(move || http::put(&agent, &url, &headers, &body)).await?;
        self.check(path, reply).map(drop)
    }

    fn check(&self, path: &str, reply: Reply) -> Result<Vec<u8>> {
        match reply.status {
            _ if reply.is_success() => Ok(reply.body),
            403 => Err(Error::DeviceIdMismatch {
                expected: self.identity.id.clone(),
            }),
            406 => Err(Error::SdkVersionMismatch {
                device: self.identity.sdk_version.clone(),
                image: String::new(),
            }),
            status => Err(Error::Http(format!(
                "{}/{path}: HTTP {status}: {}",
                self.base,
                String::from_utf8_lossy(&reply.body).trim()
            ))),
        }
    }
}
