//! InfluxDB 1.x sink over the HTTP write endpoint.

use crate::error::SinkError;
use crate::protocol::frame::TelemetryPoint;
use crate::storage::TelemetrySink;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::time::Duration;

/// Writes points as line protocol to `POST {url}/write`.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    database: String,
    retention_policy: Option<String>,
}

impl InfluxSink {
    /// The database and retention policy must already exist.
    pub fn new(
        url: &str,
        database: impl Into<String>,
        retention_policy: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            write_url: format!("{}/write", url.trim_end_matches('/')),
            database: database.into(),
            retention_policy: retention_policy.filter(|rp| !rp.is_empty()),
        })
    }

    /// Full `/write` endpoint.
    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

#[async_trait]
impl TelemetrySink for InfluxSink {
    async fn write_point(&self, point: &TelemetryPoint) -> Result<(), SinkError> {
        let mut query = vec![("db", self.database.as_str()), ("precision", "ns")];
        if let Some(rp) = &self.retention_policy {
            query.push(("rp", rp.as_str()));
        }

        let response = self
            .client
            .post(&self.write_url)
            .query(&query)
            .body(to_line_protocol(point))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &str {
        "influxdb"
    }
}

/// Render `point` as one line of InfluxDB line protocol, integer fields, ns timestamp.
pub fn to_line_protocol(point: &TelemetryPoint) -> String {
    let mut line = escape(&point.measurement, &[',', ' ']);
    for (i, (name, value)) in point.fields.iter().enumerate() {
        line.push(if i == 0 { ' ' } else { ',' });
        let _ = write!(line, "{}={}i", escape(name, &[',', '=', ' ']), value);
    }
    // Out of range past year 2262; the server stamps the point instead.
    if let Some(ns) = point.timestamp.timestamp_nanos_opt() {
        let _ = write!(line, " {ns}");
    }
    line
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use indexmap::IndexMap;

    #[test]
    fn renders_integer_fields_in_order() {
        let mut fields = IndexMap::new();
        fields.insert("V00".to_string(), 255);
        fields.insert("PUMP".to_string(), 1);
        let point = TelemetryPoint {
            measurement: "outputs".to_string(),
            fields,
            timestamp: Utc.timestamp_opt(1_700_000_000, 5).unwrap(),
        };

        assert_eq!(
            to_line_protocol(&point),
            "outputs V00=255i,PUMP=1i 1700000000000000005"
        );
    }

    #[test]
    fn escapes_special_characters() {
        let mut fields = IndexMap::new();
        fields.insert("a b".to_string(), -3);
        let point = TelemetryPoint {
            measurement: "out,puts".to_string(),
            fields,
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
        };

        assert_eq!(to_line_protocol(&point), "out\\,puts a\\ b=-3i 0");
    }

    #[test]
    fn write_url_drops_trailing_slash() {
        let sink = InfluxSink::new(
            "http://localhost:8086/",
            "graphitizer",
            Some(String::new()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(sink.write_url(), "http://localhost:8086/write");
        assert!(sink.retention_policy.is_none());
    }
}
