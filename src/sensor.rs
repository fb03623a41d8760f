//! Metric sensors: one generic sensor type driven by a table of descriptors
//! instead of one hand-written type per metric.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    coordinator::{Coordinator, Subscriber},
    device::{DeviceInfo, Snapshot},
    prelude::*,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum DeviceClass {
    #[display("battery")]
    Battery,
    #[display("power")]
    Power,
    #[display("energy")]
    Energy,
    #[display("temperature")]
    Temperature,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Everything that distinguishes one metric sensor from another.
pub struct MetricDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub device_class: DeviceClass,
    pub state_class: StateClass,

    /// Pure projection from a snapshot to this metric's value.
    pub extract: fn(&Snapshot) -> Option<f64>,
}

/// All metrics the monitor exposes. Battery entries stay [`None`] on string
/// inverters, which simply never report them.
pub const METRICS: &[MetricDescriptor] = &[
    MetricDescriptor {
        key: "active_power",
        name: "Active power",
        unit: "W",
        device_class: DeviceClass::Power,
        state_class: StateClass::Measurement,
        extract: |snapshot| snapshot.get("active_power"),
    },
    MetricDescriptor {
        key: "energy_today",
        name: "Energy today",
        unit: "kWh",
        device_class: DeviceClass::Energy,
        state_class: StateClass::TotalIncreasing,
        extract: |snapshot| snapshot.get("energy_today"),
    },
    MetricDescriptor {
        key: "energy_total",
        name: "Energy total",
        unit: "kWh",
        device_class: DeviceClass::Energy,
        state_class: StateClass::TotalIncreasing,
        extract: |snapshot| snapshot.get("energy_total"),
    },
    MetricDescriptor {
        key: "inverter_temperature",
        name: "Inverter temperature",
        unit: "°C",
        device_class: DeviceClass::Temperature,
        state_class: StateClass::Measurement,
        extract: |snapshot| snapshot.get("inverter_temperature"),
    },
    MetricDescriptor {
        key: "batt_charge_level",
        name: "Battery charge level",
        unit: "%",
        device_class: DeviceClass::Battery,
        state_class: StateClass::Measurement,
        extract: |snapshot| snapshot.get("batt_charge_level"),
    },
    MetricDescriptor {
        key: "batt_charge_rate",
        name: "Battery charge rate",
        unit: "W",
        device_class: DeviceClass::Power,
        state_class: StateClass::Measurement,
        extract: |snapshot| snapshot.get("batt_charge_rate"),
    },
];

/// One sensor. Holds no snapshot of its own: it re-reads the coordinator at
/// notification time and only records its projected value.
pub struct MetricSensor {
    descriptor: &'static MetricDescriptor,
    device: Arc<DeviceInfo>,
    value: Mutex<Option<f64>>,
}

impl MetricSensor {
    pub fn new(descriptor: &'static MetricDescriptor, device: Arc<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self { descriptor, device, value: Mutex::new(None) })
    }

    /// Serial-scoped identifier, unique across devices.
    #[must_use]
    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.device.identifier, self.descriptor.key)
    }

    /// Last recorded value. Frozen across failed fetches: the coordinator does
    /// not notify on failure, so this never flickers to empty.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Subscriber for MetricSensor {
    fn on_update(&self, coordinator: &Coordinator) {
        let Some(snapshot) = coordinator.current().snapshot else {
            return;
        };
        let value = (self.descriptor.extract)(&snapshot);
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
        match value {
            Some(value) => {
                info!(sensor = %self.unique_id(), value, unit = self.descriptor.unit, "updated");
            }
            None => debug!(sensor = %self.unique_id(), "not reported by the device"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::device::solis_device;

    #[test]
    fn metric_keys_are_unique() {
        let mut keys: Vec<_> = METRICS.iter().map(|descriptor| descriptor.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), METRICS.len());
    }

    #[test]
    fn descriptors_project_their_own_metric() {
        let snapshot =
            Snapshot::from_iter([("batt_charge_level", 42.0), ("batt_charge_rate", -150.0)]);
        for descriptor in METRICS {
            assert_eq!((descriptor.extract)(&snapshot), snapshot.get(descriptor.key));
        }
        let empty = Snapshot::new(BTreeMap::new());
        for descriptor in METRICS {
            assert_eq!((descriptor.extract)(&empty), None);
        }
    }

    #[test]
    fn unique_id_is_scoped_by_serial() {
        let device = Arc::new(solis_device("100200300"));
        let sensor = MetricSensor::new(&METRICS[0], device);
        assert_eq!(sensor.unique_id(), "100200300_active_power");
        assert_eq!(sensor.value(), None);
    }
}
