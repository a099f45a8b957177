//! Device location metadata.
//!
//! Location is supplied by an external lookup; this module only serialises it,
//! either as a single-line header value carried with each upload or as the
//! body of a one-off report to a separate endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WakeError};
use crate::transport::upload::{await_headers, read_body, send_all, UploadConfig, UploadProgress};
use crate::transport::{Request, ResponseBuffer, Transport};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationInfo {
    pub ip: String,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    pub isp: String,
}

#[derive(Serialize)]
struct LocationReport<'a> {
    api_key: &'a str,
    #[serde(flatten)]
    location: &'a LocationInfo,
}

impl LocationInfo {
    /// Compact JSON restricted to printable ASCII, so it is a valid HTTP
    /// header value whatever the city or ISP name contains.
    pub fn header_value(&self) -> String {
        // Serialising plain strings and floats cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        escape_non_ascii(&json)
    }

    /// Body of the location report: the location plus the API key.
    pub fn report_body(&self, api_key: &str) -> Result<Vec<u8>> {
        serde_json::to_vec(&LocationReport {
            api_key,
            location: self,
        })
        .map_err(|e| WakeError::Other(e.into()))
    }
}

/// Replace every non-ASCII or control character with a `\uXXXX` escape
/// (UTF-16 surrogate pairs above the BMP).
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() && !c.is_ascii_control() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// POST the location report. Returns the response status on success.
pub fn report_location(
    transport: &dyn Transport,
    url: &str,
    api_key: &str,
    location: &LocationInfo,
    timeout: Duration,
) -> Result<u16> {
    let body = location.report_body(api_key)?;
    let request = Request::post(url, body.len() as u64, timeout)
        .header("Content-Type", "application/json");
    let config = UploadConfig {
        response_timeout: timeout,
        inter_chunk_delay: Duration::ZERO,
        ..Default::default()
    };

    let mut conn = transport.open(&request)?;
    let mut progress = UploadProgress::new(body.len());
    send_all(conn.as_mut(), &body, &mut progress, &config)?;
    let head = await_headers(conn.as_mut(), &config)?;
    let mut response = ResponseBuffer::with_capacity(512);
    read_body(conn.as_mut(), &mut response, 511);

    if !head.is_success() {
        warn!(status = head.status, body = %response.text(), "location report rejected");
        return Err(WakeError::HttpStatus(head.status));
    }
    info!(status = head.status, city = %location.city, "location reported");
    Ok(head.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;

    fn taipei() -> LocationInfo {
        LocationInfo {
            ip: "203.0.113.7".into(),
            country: "Taiwan".into(),
            country_code: "TW".into(),
            city: "臺北".into(),
            region: "Taipei".into(),
            latitude: 25.05,
            longitude: 121.53,
            timezone: "Asia/Taipei".into(),
            isp: "Example ISP".into(),
        }
    }

    #[test]
    fn header_value_is_single_line_ascii() {
        let value = taipei().header_value();
        assert!(value.chars().all(|c| c.is_ascii() && !c.is_ascii_control()));
        assert!(value.contains(r#""city":"\u81fa\u5317""#));
        let back: LocationInfo = serde_json::from_str(&value).unwrap();
        assert_eq!(back, taipei());
    }

    #[test]
    fn report_includes_api_key_and_all_fields() {
        let transport = ScriptedTransport::responding(200, b"{}");
        let status = report_location(
            &transport,
            "http://svc/location",
            "secret",
            &taipei(),
            Duration::from_millis(50),
        )
        .unwrap();
        assert_eq!(status, 200);

        let rec = transport.record.lock();
        let body: serde_json::Value = serde_json::from_slice(&rec.body).unwrap();
        for key in [
            "api_key",
            "ip",
            "country",
            "country_code",
            "city",
            "region",
            "latitude",
            "longitude",
            "timezone",
            "isp",
        ] {
            assert!(body.get(key).is_some(), "missing {key}");
        }
        assert_eq!(body["api_key"], "secret");
        assert_eq!(
            rec.requests[0].header_value("content-type"),
            Some("application/json")
        );
    }
}
