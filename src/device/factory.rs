/// Registry of device backends keyed by device type name.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::{
    config::{DeviceConfig, DeviceType},
    device::{binary, hardware, qemu, DeviceBackend},
    error::{HarnessError, Result},
};

pub type DeviceConstructor = fn(&DeviceConfig) -> Result<Box<dyn DeviceBackend>>;

static REGISTRY: Lazy<RwLock<HashMap<String, DeviceConstructor>>> = Lazy::new(|| {
    let builtins: [(DeviceType, DeviceConstructor); 5] = [
        (DeviceType::Native, binary::native),
        (DeviceType::Unit, binary::unit),
        (DeviceType::Custom, binary::custom),
        (DeviceType::Hardware, hardware::construct),
        (DeviceType::Qemu, qemu::construct),
    ];
    RwLock::new(
        builtins
            .into_iter()
            .map(|(kind, ctor)| (kind.to_string(), ctor))
            .collect(),
    )
});

/// Register a backend constructor, replacing any previous one of that name.
pub fn register(name: &str, constructor: DeviceConstructor) {
    log::debug!("Registering device type {name}");
    REGISTRY.write().insert(name.to_string(), constructor);
}

pub fn get_device(name: &str) -> Result<DeviceConstructor> {
    let constructor = REGISTRY.read().get(name).copied();
    constructor.ok_or_else(|| {
        HarnessError::config(format!(
            "unknown device type `{name}`; known types: {}",
            device_types().join(", ")
        ))
    })
}

/// Registered names, sorted.
pub fn device_types() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let names = device_types();
        for builtin in ["custom", "hardware", "native", "qemu", "unit"] {
            assert!(names.iter().any(|n| n == builtin), "{builtin} missing");
        }
    }

    #[test]
    fn test_unknown_lists_known_names() {
        let err = get_device("simulator").err().unwrap();
        let message = err.to_string();
        assert!(message.contains("simulator"));
        assert!(message.contains("custom, hardware, native, qemu, unit"));
    }
}
