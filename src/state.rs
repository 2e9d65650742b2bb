//! Process-wide shared state: just the broker and the resolved config, per
//! §9 "Global singletons" — one broker instance, constructed explicitly and
//! threaded through, never a module-level static.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::config::Config;

/// Stable fan-out key: `type_id_ip_port`, per §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(String);

impl DeviceIdentifier {
    pub fn new(device_type: &str, device_id: &str, device_ip: &str, device_port: u16) -> Self {
        Self(format!("{device_type}_{device_id}_{device_ip}_{device_port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub config: Config,
}

impl AppState {
    pub fn new(broker: Arc<Broker>, config: Config) -> Self {
        Self { broker, config }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identifier_formats_as_underscore_joined() {
        let id = DeviceIdentifier::new("android", "emulator-5554", "192.168.1.10", 5555);
        assert_eq!(id.as_str(), "android_emulator-5554_192.168.1.10_5555");
    }
}
