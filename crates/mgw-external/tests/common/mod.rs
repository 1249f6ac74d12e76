//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mgw_external::config::{EndpointConfig, ExternalClientConfig, MockConfig, TransportConfig};
use mgw_external::transport::mock::MockChannel;
use mgw_external::{DeviceIdentity, DeviceModule, DeviceStatus, ModuleError, ModuleLibrary};

/// Module whose error summary is the concatenation of all statuses
pub struct AppendingModule {
    pub number: u32,
}

impl DeviceModule for AppendingModule {
    fn module_number(&self) -> u32 {
        self.number
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
        let mut error = current_error.to_vec();
        error.extend_from_slice(status);
        Ok(error)
    }
}

pub fn library(numbers: &[u32]) -> ModuleLibrary {
    let mut library = ModuleLibrary::new();
    for &number in numbers {
        library.register(Arc::new(AppendingModule { number }));
    }
    library
}

pub fn device(module: u32, role: &str) -> DeviceIdentity {
    DeviceIdentity::new(module, 0, role, role, 0)
}

pub fn device_status(device: &DeviceIdentity, data: &[u8]) -> DeviceStatus {
    DeviceStatus {
        device: device.clone(),
        status_data: data.to_vec(),
    }
}

pub fn endpoint(name: &str, modules: Vec<u32>) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        modules,
        transport: TransportConfig::Mock(MockConfig::default()),
    }
}

/// Short timeouts so failure paths finish quickly
pub fn config(endpoints: Vec<EndpointConfig>) -> ExternalClientConfig {
    let mut config = ExternalClientConfig::new("fleet", "car_1");
    config.response_timeout_ms = 200;
    config.receive_poll_ms = 20;
    config.status_ack_timeout_ms = 1000;
    config.reconnect_delay_ms = 50;
    config.endpoints = endpoints;
    config
}

pub fn mock() -> Arc<MockChannel> {
    Arc::new(MockChannel::new(&MockConfig::default()))
}

/// Poll `condition` until it holds or two seconds have passed
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
