//! Blocking HTTP client calls run off the async runtime.

use std::io::Read;
use std::time::Duration;

use ureq::Agent;

use crate::{Error, Result};

/// Header carrying the target device id.
pub const DEVICE_ID_HEADER: &str = "X-Jaguar-Device-ID";
/// Header carrying the SDK version an image was built with.
pub const SDK_VERSION_HEADER: &str = "X-Jaguar-SDK-Version";
/// Header marking an installed container as disabled.
pub const DISABLED_HEADER: &str = "X-Jaguar-Disabled";
/// Header naming the container to install or remove.
pub const CONTAINER_NAME_HEADER: &str = "X-Jaguar-Container-Name";
/// Header carrying a container run timeout in seconds.
pub const CONTAINER_TIMEOUT_HEADER: &str = "X-Jaguar-Container-Timeout";
/// Header carrying the CRC-32 of a pushed image, in decimal.
pub const CRC32_HEADER: &str = "X-Jaguar-CRC32";

/// Status code and body of a finished request.
#[derive(Debug)]
pub(crate) struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub(crate) const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Builds an agent that reports HTTP error statuses as replies.
pub(crate) fn agent(timeout: Duration) -> Agent {
    Agent::config_builder()
        .http_status_as_error(false)
        .timeout_connect(Some(timeout))
        .timeout_recv_response(Some(timeout))
        .build()
        .into()
}

/// Returns `address` with an `http://` scheme.
pub(crate) fn base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    }
}

/// Runs a blocking request closure on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Http(format!("request task failed: {e}")))?
}

/// Reads a whole response into a [`Reply`].
pub(crate) fn read_reply(resp: ureq::http::Response<ureq::Body>) -> Result<Reply> {
    let status = resp.status().as_u16();
    let mut body = Vec::new();
    resp.into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| Error::Http(e.to_string()))?;
    Ok(Reply { status, body })
}

/// Performs a GET.
pub(crate) fn get(agent: &Agent, url: &str, headers: &[(&str, String)]) -> Result<Reply> {
    let mut req = agent.get(url);
    for (name, value) in headers {
        req = req.header(*name, value.as_str());
    }
    let resp = req.call().map_err(|e| Error::Http(format!("{url}: {e}")))?;
    read_reply(resp)
}

/// Performs a PUT with `body`.
pub(crate) fn put(
    agent: &Agent,
    url: &str,
    headers: &[(&str, String)],
    body: &[u8],
) -> Result<Reply> {
    let mut req = agent.put(url);
    for (name, value) in headers {
        req = req.header(*name, value.as_str());
    }
    let resp = req.send(body).map_err(|e| Error::Http(format!("{url}: {e}")))?;
    read_reply(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_adds_scheme_once() {
        assert_eq!(base_url("192.168.1.5:9000"), "http://192.168.1.5:9000");
        assert_eq!(base_url("http://10.0.0.2/"), "http://10.0.0.2");
        assert_eq!(base_url("https://dev.local"), "https://dev.local");
    }

    #[test]
    fn success_range() {
        let ok = Reply { status: 204, body: Vec::new() };
        let bad = Reply { status: 406, body: Vec::new() };
        assert!(ok.is_success());
        assert!(!bad.is_success());
    }
}
