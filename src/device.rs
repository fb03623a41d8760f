//! Device-facing contracts: the endpoint, the snapshot produced by one fetch,
//! and the client every transport implementation has to satisfy.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Network identity of one physical inverter: where to reach it and which
/// serial number is expected to answer there.
///
/// The serial doubles as the externally visible device identifier.
#[derive(Clone, Debug, Eq, PartialEq, derive_more::Display)]
#[display("{address} ({serial})")]
pub struct Endpoint {
    pub address: String,
    pub serial: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, serial: impl Into<String>) -> Self {
        Self { address: address.into(), serial: serial.into() }
    }
}

/// Immutable set of metric readings produced atomically by one fetch.
///
/// A new snapshot always replaces the previous one wholesale: values from
/// different fetches are never mixed.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    taken_at: DateTime<Utc>,
    values: BTreeMap<String, f64>,
}

impl Snapshot {
    #[must_use]
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self { taken_at: Utc::now(), values }
    }

    /// Value of the given metric, or [`None`] when the device did not report it.
    #[must_use]
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }

    #[must_use]
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(values: I) -> Self {
        Self::new(values.into_iter().map(|(name, value)| (name.into(), value)).collect())
    }
}

/// Anything that can go wrong while talking to the inverter.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device could not be reached at all.
    #[error("failed to reach the inverter")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The device answered, but the response made no sense.
    #[error("malformed response from the inverter: {0}")]
    Protocol(String),

    /// The device at the configured address is not the configured device.
    #[error("inverter reported serial `{actual}`, expected `{expected}`")]
    SerialMismatch { expected: String, actual: String },
}

impl DeviceError {
    pub fn connection(error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::Connection(error.into())
    }

    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// One round-trip-per-fetch client for a single device.
///
/// The coordinator owns exactly one client and never runs two fetches against
/// it concurrently, so implementations are free to keep mutable connection
/// state without their own locking.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Open the connection. Called once before the first fetch, and again
    /// after the coordinator has dropped a failed connection.
    async fn connect(&mut self) -> Result<(), DeviceError>;

    /// Retrieve all current metric values in one round-trip.
    async fn fetch_all(&mut self) -> Result<Snapshot, DeviceError>;

    /// Release the connection. Errors on teardown are not interesting.
    async fn close(&mut self);
}

/// Static identity of the monitored device, keyed by its serial number.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: &'static str,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub sw_version: &'static str,
}

#[must_use]
pub fn solis_device(serial: &str) -> DeviceInfo {
    DeviceInfo {
        identifier: serial.to_owned(),
        name: "solis",
        manufacturer: "ginlong",
        model: "solis",
        sw_version: env!("CARGO_PKG_VERSION"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_absent_metrics_as_none() {
        let snapshot = Snapshot::from_iter([("active_power", 1370.0)]);
        assert_eq!(snapshot.get("active_power"), Some(1370.0));
        assert_eq!(snapshot.get("batt_charge_level"), None);
    }

    #[test]
    fn endpoint_displays_like_a_config_entry_title() {
        let endpoint = Endpoint::new("10.0.0.5", "100200300");
        assert_eq!(endpoint.to_string(), "10.0.0.5 (100200300)");
    }
}
