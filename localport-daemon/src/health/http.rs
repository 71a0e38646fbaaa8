//! HTTP request probe

use std::time::Duration;

use crate::config::ProbeSettings;

/// Issue a request (GET by default) and compare the response status
/// against the expected set (default: 200 only).
pub(super) async fn check(
    settings: &ProbeSettings,
    local_port: u16,
    deadline: Duration,
) -> Result<(), String> {
    let url = settings
        .url
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}/", local_port));

    let method = settings
        .method
        .as_deref()
        .unwrap_or("GET")
        .parse::<reqwest::Method>()
        .map_err(|_| format!("invalid http method: {:?}", settings.method))?;

    let client = reqwest::Client::builder()
        .timeout(deadline)
        .build()
        .map_err(|e| format!("http client construction failed: {}", e))?;

    let mut request = client.request(method, &url);
    if let Some(ref headers) = settings.headers {
        for (name, value) in headers {
            request = request.header(name, value);
        }
    }

    let response = request
        .send()
        .await
        .map_err(|e| format!("request to {} failed: {}", url, e))?;

    let status = response.status().as_u16();
    let expected = settings
        .expected_status
        .clone()
        .unwrap_or_else(|| vec![200]);

    if expected.contains(&status) {
        Ok(())
    } else {
        Err(format!(
            "{} returned status {} (expected one of {:?})",
            url, status, expected
        ))
    }
}
