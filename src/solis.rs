//! HTTP client for the Ginlong Wi-Fi data logger that fronts a Solis inverter.
//!
//! The stick serves one status document with every current metric, so a single
//! round-trip yields a complete [`Snapshot`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    device::{DeviceClient, DeviceError, Endpoint, Snapshot},
    prelude::*,
};

const STATUS_PATH: &str = "/status.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SolisClient {
    endpoint: Endpoint,
    client: reqwest::Client,
    status_url: String,
}

impl SolisClient {
    pub fn try_new(endpoint: Endpoint) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(DeviceError::connection)?;
        let status_url = format!("http://{}{STATUS_PATH}", endpoint.address);
        Ok(Self { endpoint, client, status_url })
    }

    /// One fetch of the status document with the serial check applied.
    /// Used stand-alone at configuration time, before any coordinator exists.
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    pub async fn probe(&self) -> Result<(), DeviceError> {
        let document = self.get_status().await?;
        self.check_serial(&document)?;
        info!(sw_version = %document.sw_version, "probed");
        Ok(())
    }

    async fn get_status(&self) -> Result<StatusDocument, DeviceError> {
        let response = self
            .client
            .get(&self.status_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(DeviceError::connection)?;
        response
            .json()
            .await
            .map_err(|error| DeviceError::Protocol(error.to_string()))
    }

    fn check_serial(&self, document: &StatusDocument) -> Result<(), DeviceError> {
        if document.serial == self.endpoint.serial {
            Ok(())
        } else {
            Err(DeviceError::SerialMismatch {
                expected: self.endpoint.serial.clone(),
                actual: document.serial.clone(),
            })
        }
    }
}

#[async_trait]
impl DeviceClient for SolisClient {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        // HTTP is connectionless; the handshake is an identity probe.
        self.probe().await
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn fetch_all(&mut self) -> Result<Snapshot, DeviceError> {
        let document = self.get_status().await?;
        self.check_serial(&document)?;
        Ok(document.into_snapshot())
    }

    async fn close(&mut self) {}
}

/// The logger stick's status document. Absent fields are normal: string
/// inverters simply have no battery block.
#[derive(Deserialize)]
struct StatusDocument {
    #[serde(rename = "webdata_sn")]
    serial: String,

    #[serde(rename = "webdata_msvn", default)]
    sw_version: String,

    #[serde(rename = "webdata_now_p")]
    active_power: Option<f64>,

    #[serde(rename = "webdata_today_e")]
    energy_today: Option<f64>,

    #[serde(rename = "webdata_total_e")]
    energy_total: Option<f64>,

    #[serde(rename = "webdata_temp")]
    inverter_temperature: Option<f64>,

    #[serde(rename = "webdata_bat_soc")]
    batt_charge_level: Option<f64>,

    #[serde(rename = "webdata_bat_p")]
    batt_charge_rate: Option<f64>,
}

impl StatusDocument {
    fn into_snapshot(self) -> Snapshot {
        let values = [
            ("active_power", self.active_power),
            ("energy_today", self.energy_today),
            ("energy_total", self.energy_total),
            ("inverter_temperature", self.inverter_temperature),
            ("batt_charge_level", self.batt_charge_level),
            ("batt_charge_rate", self.batt_charge_rate),
        ];
        values
            .into_iter()
            .filter_map(|(metric, value)| value.map(|value| (metric, value)))
            .collect()
    }
}
