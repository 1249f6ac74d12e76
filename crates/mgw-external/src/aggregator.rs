//! Error aggregator
//!
//! Keeps, per device, the last status that could not be delivered and the
//! error summary accumulated by the device module. Entries are replayed in
//! the status phase of the next handshake.

use std::collections::HashMap;
use std::sync::Arc;

use mgw_core::{DeviceIdentity, DeviceModule, ModuleError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("Device type {device_type} of module {module} not supported")]
    DeviceNotSupported { module: u32, device_type: u32 },

    #[error("Device {0} not registered")]
    DeviceNotRegistered(DeviceIdentity),

    #[error("No message available for device {0}")]
    NoMessageAvailable(DeviceIdentity),

    #[error(transparent)]
    Aggregation(#[from] ModuleError),
}

#[derive(Debug, Default, Clone)]
struct DeviceBacklog {
    last_status: Vec<u8>,
    error: Vec<u8>,
}

/// Error aggregator for one device module of one endpoint
pub struct ErrorAggregator {
    module: Arc<dyn DeviceModule>,
    devices: HashMap<DeviceIdentity, DeviceBacklog>,
}

impl ErrorAggregator {
    pub fn new(module: Arc<dyn DeviceModule>) -> Self {
        Self {
            module,
            devices: HashMap::new(),
        }
    }

    /// Fold `status` into the backlog of `device`
    ///
    /// The error summary is recomputed by the device module and the last
    /// status is always replaced.
    pub fn add(&mut self, status: &[u8], device: &DeviceIdentity) -> Result<(), AggregatorError> {
        if !self.module.is_device_type_supported(device.device_type) {
            return Err(AggregatorError::DeviceNotSupported {
                module: device.module,
                device_type: device.device_type,
            });
        }

        let current_error = self
            .devices
            .get(device)
            .map(|b| b.error.as_slice())
            .unwrap_or(&[]);
        let error = self
            .module
            .aggregate_error(current_error, status, device.device_type)?;

        let backlog = self.devices.entry(device.clone()).or_default();
        backlog.error = error;
        backlog.last_status = status.to_vec();
        debug!(%device, "Status folded into error aggregator");
        Ok(())
    }

    /// Replace the last status of a registered device, leaving its error
    /// summary untouched
    pub fn set_last_status(
        &mut self,
        status: &[u8],
        device: &DeviceIdentity,
    ) -> Result<(), AggregatorError> {
        let backlog = self
            .devices
            .get_mut(device)
            .ok_or_else(|| AggregatorError::DeviceNotRegistered(device.clone()))?;
        backlog.last_status = status.to_vec();
        Ok(())
    }

    pub fn is_device_registered(&self, device: &DeviceIdentity) -> bool {
        self.devices.contains_key(device)
    }

    pub fn get_last_status(&self, device: &DeviceIdentity) -> Result<Vec<u8>, AggregatorError> {
        let backlog = self
            .devices
            .get(device)
            .ok_or_else(|| AggregatorError::DeviceNotRegistered(device.clone()))?;
        if backlog.last_status.is_empty() {
            return Err(AggregatorError::NoMessageAvailable(device.clone()));
        }
        Ok(backlog.last_status.clone())
    }

    pub fn get_error(&self, device: &DeviceIdentity) -> Result<Vec<u8>, AggregatorError> {
        let backlog = self
            .devices
            .get(device)
            .ok_or_else(|| AggregatorError::DeviceNotRegistered(device.clone()))?;
        if backlog.error.is_empty() {
            return Err(AggregatorError::NoMessageAvailable(device.clone()));
        }
        Ok(backlog.error.clone())
    }

    /// Forget one device, e.g. after it disconnected
    pub fn remove_device(&mut self, device: &DeviceIdentity) -> bool {
        self.devices.remove(device).is_some()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Error summary is the concatenation of all statuses
    struct Appending;

    impl DeviceModule for Appending {
        fn module_number(&self) -> u32 {
            1
        }

        fn is_device_type_supported(&self, device_type: u32) -> bool {
            device_type < 2
        }

        fn aggregate_error(
            &self,
            current_error: &[u8],
            status: &[u8],
            _device_type: u32,
        ) -> Result<Vec<u8>, ModuleError> {
            if status == b"bad" {
                return Err(ModuleError::AggregationFailed("bad status".to_string()));
            }
            let mut error = current_error.to_vec();
            error.extend_from_slice(status);
            Ok(error)
        }
    }

    fn aggregator() -> ErrorAggregator {
        ErrorAggregator::new(Arc::new(Appending))
    }

    fn device(device_type: u32) -> DeviceIdentity {
        DeviceIdentity::new(1, device_type, "role", "name", 0)
    }

    #[test]
    fn test_add_accumulates_error_and_replaces_status() {
        let mut agg = aggregator();
        agg.add(b"ab", &device(0)).unwrap();
        agg.add(b"cd", &device(0)).unwrap();

        assert_eq!(agg.get_last_status(&device(0)).unwrap(), b"cd".to_vec());
        assert_eq!(agg.get_error(&device(0)).unwrap(), b"abcd".to_vec());
    }

    #[test]
    fn test_set_last_status_keeps_error() {
        let mut agg = aggregator();
        assert_eq!(
            agg.set_last_status(b"x", &device(0)),
            Err(AggregatorError::DeviceNotRegistered(device(0)))
        );

        agg.add(b"ab", &device(0)).unwrap();
        agg.set_last_status(b"cd", &device(0)).unwrap();
        assert_eq!(agg.get_last_status(&device(0)).unwrap(), b"cd".to_vec());
        assert_eq!(agg.get_error(&device(0)).unwrap(), b"ab".to_vec());
    }

    #[rstest]
    #[case::unregistered(false, AggregatorError::DeviceNotRegistered(device(1)))]
    #[case::empty(true, AggregatorError::NoMessageAvailable(device(1)))]
    fn test_lookup_errors(#[case] register_empty: bool, #[case] expected: AggregatorError) {
        let mut agg = aggregator();
        if register_empty {
            agg.add(b"", &device(1)).unwrap();
        }
        assert_eq!(agg.get_last_status(&device(1)), Err(expected.clone()));
        assert_eq!(agg.get_error(&device(1)), Err(expected));
    }

    #[test]
    fn test_rejects_unsupported_device_type() {
        let mut agg = aggregator();
        assert_eq!(
            agg.add(b"x", &device(5)),
            Err(AggregatorError::DeviceNotSupported {
                module: 1,
                device_type: 5
            })
        );
        assert!(agg.is_empty());
    }

    #[test]
    fn test_failed_aggregation_keeps_previous_entry() {
        let mut agg = aggregator();
        agg.add(b"ok", &device(0)).unwrap();
        assert!(matches!(
            agg.add(b"bad", &device(0)),
            Err(AggregatorError::Aggregation(_))
        ));
        assert_eq!(agg.get_last_status(&device(0)).unwrap(), b"ok".to_vec());
    }

    #[test]
    fn test_clear_and_remove() {
        let mut agg = aggregator();
        agg.add(b"a", &device(0)).unwrap();
        agg.add(b"b", &device(1)).unwrap();

        assert!(agg.remove_device(&device(0)));
        assert!(!agg.is_device_registered(&device(0)));
        assert_eq!(agg.len(), 1);

        agg.clear();
        assert!(agg.is_empty());
    }
}
