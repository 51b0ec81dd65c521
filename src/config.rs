/// Harness configuration records
///
/// `DeviceConfig` is built once from the command line (and an optional
/// hardware map) and never mutated afterwards.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{HarnessError, Result};

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_FLASH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of device under test.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceType {
    /// Native simulator executable (`zephyr.exe`)
    Native,
    /// Unit test executable (`testbinary`)
    Unit,
    /// Caller supplied script or binary
    Custom,
    /// Physical board on a serial port
    Hardware,
    /// QEMU emulator driven through a FIFO pair
    Qemu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_type: DeviceType,
    pub build_dir: Option<PathBuf>,
    pub binary_file: Option<PathBuf>,
    /// Serial ports; the first one is the main console.
    pub serial: Vec<String>,
    /// Command whose pseudo-terminal replaces the serial port.
    pub serial_pty: Option<String>,
    pub baud: u32,
    pub id: Option<String>,
    pub product: Option<String>,
    pub platform: Option<String>,
    pub runner: Option<String>,
    pub runner_params: Vec<String>,
    pub west_flash_extra_args: Vec<String>,
    pub pre_script: Option<PathBuf>,
    pub post_script: Option<PathBuf>,
    pub post_flash_script: Option<PathBuf>,
    pub fixtures: Vec<String>,
    pub extra_args: Vec<String>,
    pub flash_before: bool,
    pub flash_timeout: Duration,
    pub base_timeout: Duration,
    pub connection_timeout: Duration,
}

impl DeviceConfig {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            build_dir: None,
            binary_file: None,
            serial: Vec::new(),
            serial_pty: None,
            baud: DEFAULT_BAUD,
            id: None,
            product: None,
            platform: None,
            runner: None,
            runner_params: Vec::new(),
            west_flash_extra_args: Vec::new(),
            pre_script: None,
            post_script: None,
            post_flash_script: None,
            fixtures: Vec::new(),
            extra_args: Vec::new(),
            flash_before: false,
            flash_timeout: DEFAULT_FLASH_TIMEOUT,
            base_timeout: DEFAULT_BASE_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    pub fn with_build_dir(mut self, build_dir: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(build_dir.into());
        self
    }

    pub fn with_binary_file(mut self, binary_file: impl Into<PathBuf>) -> Self {
        self.binary_file = Some(binary_file.into());
        self
    }

    pub fn build_dir(&self) -> Option<&Path> {
        self.build_dir.as_deref()
    }

    /// Check the invariants every adapter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.flash_timeout.is_zero() {
            return Err(HarnessError::config("flash timeout must be greater than zero"));
        }
        if self.build_dir.is_none() && self.device_type != DeviceType::Custom {
            return Err(HarnessError::config(format!(
                "--build-dir is required for device type `{}`",
                self.device_type
            )));
        }
        match self.device_type {
            DeviceType::Custom if self.binary_file.is_none() => Err(HarnessError::config(
                "--binary-file is required for device type `custom`",
            )),
            DeviceType::Hardware if self.serial.is_empty() && self.serial_pty.is_none() => {
                Err(HarnessError::config(
                    "hardware devices need --device-serial or --device-serial-pty",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Transport used by the device management client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum McumgrTransport {
    Serial,
    Udp,
    L2cap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McumgrConfig {
    pub transport: McumgrTransport,
    /// Port for the serial transport; defaults to the device console.
    pub serial: Option<String>,
    pub udp_addr: String,
    pub l2cap_addr: Option<String>,
    pub l2cap_psm: u16,
    pub timeout: Duration,
}

impl Default for McumgrConfig {
    fn default() -> Self {
        Self {
            transport: McumgrTransport::Serial,
            serial: None,
            udp_addr: "192.0.2.1".to_string(),
            l2cap_addr: None,
            l2cap_psm: 0x0080,
            timeout: twister_smp::DEFAULT_TIMEOUT,
        }
    }
}

/// Session wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwisterHarnessConfig {
    pub devices: Vec<DeviceConfig>,
    pub shell_timeout: Duration,
    pub mcumgr: McumgrConfig,
}

impl TwisterHarnessConfig {
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            devices: vec![device],
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
            mcumgr: McumgrConfig::default(),
        }
    }

    /// The device the `dut` fixture launches.
    pub fn main_device(&self) -> Result<&DeviceConfig> {
        self.devices
            .first()
            .ok_or_else(|| HarnessError::config("no device configured"))
    }
}

/// One board of a twister hardware map file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareMapEntry {
    pub platform: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default)]
    pub runner_params: Vec<String>,
    #[serde(default)]
    pub serial_pty: Option<String>,
    #[serde(default)]
    pub pre_script: Option<PathBuf>,
    #[serde(default)]
    pub post_script: Option<PathBuf>,
    #[serde(default)]
    pub post_flash_script: Option<PathBuf>,
    #[serde(default)]
    pub flash_timeout: Option<u64>,
    #[serde(default)]
    pub flash_before: Option<bool>,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

fn default_connected() -> bool {
    true
}

/// Parsed hardware map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareMap {
    pub entries: Vec<HardwareMapEntry>,
}

impl HardwareMap {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            HarnessError::config(format!("cannot read hardware map {}: {err}", path.display()))
        })?;
        Self::parse(&text, path.parent())
    }

    /// Parse map text. Relative script paths resolve against `ZEPHYR_BASE`
    /// when it is set, else against `base`.
    pub fn parse(text: &str, base: Option<&Path>) -> Result<Self> {
        let mut entries: Vec<HardwareMapEntry> = serde_yaml::from_str(text)
            .map_err(|err| HarnessError::config(format!("invalid hardware map: {err}")))?;

        let root = std::env::var_os("ZEPHYR_BASE")
            .map(PathBuf::from)
            .or_else(|| base.map(Path::to_path_buf));
        if let Some(root) = root {
            for entry in &mut entries {
                for script in [
                    &mut entry.pre_script,
                    &mut entry.post_script,
                    &mut entry.post_flash_script,
                ]
                .into_iter()
                .flatten()
                {
                    if script.is_relative() {
                        *script = root.join(&*script);
                    }
                }
            }
        }
        Ok(Self { entries })
    }

    /// Pick a connected board by id, else by platform.
    pub fn select(&self, id: Option<&str>, platform: Option<&str>) -> Result<&HardwareMapEntry> {
        let mut connected = self.entries.iter().filter(|e| e.connected);
        let found = match (id, platform) {
            (Some(id), _) => connected.find(|e| e.id.as_deref() == Some(id)),
            (None, Some(platform)) => connected.find(|e| e.platform == platform),
            (None, None) => {
                return Err(HarnessError::config(
                    "--hardware-map needs --device-id or --platform to select a board",
                ))
            }
        };
        found.ok_or_else(|| {
            HarnessError::config(format!(
                "no connected board matches id={id:?} platform={platform:?} in hardware map"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    const MAP: &str = r#"
- connected: true
  id: "000683759358"
  platform: nrf52840dk/nrf52840
  product: J-Link
  runner: nrfjprog
  serial: /dev/ttyACM0
  flash_timeout: 90
  post_flash_script: scripts/reset.sh
- connected: false
  id: "0001"
  platform: frdm_k64f
  runner: pyocd
  serial: /dev/ttyACM1
"#;

    #[test]
    fn test_device_type_names() {
        assert_eq!(DeviceType::from_str("qemu").unwrap(), DeviceType::Qemu);
        assert_eq!(DeviceType::Hardware.to_string(), "hardware");
        assert!(DeviceType::from_str("simulator").is_err());
        assert_eq!(DeviceType::iter().count(), 5);
    }

    #[test]
    fn test_validate() {
        assert!(DeviceConfig::new(DeviceType::Native).validate().is_err());
        assert!(DeviceConfig::new(DeviceType::Native)
            .with_build_dir("/tmp/build")
            .validate()
            .is_ok());
        assert!(DeviceConfig::new(DeviceType::Custom).validate().is_err());
        assert!(DeviceConfig::new(DeviceType::Custom)
            .with_binary_file("/bin/cat")
            .validate()
            .is_ok());

        let mut zero = DeviceConfig::new(DeviceType::Native).with_build_dir("/tmp/build");
        zero.flash_timeout = Duration::ZERO;
        assert!(matches!(zero.validate(), Err(HarnessError::Config(_))));

        let hardware = DeviceConfig::new(DeviceType::Hardware).with_build_dir("/tmp/build");
        assert!(hardware.validate().is_err());
    }

    #[test]
    fn test_hardware_map_select() {
        let map = HardwareMap::parse(MAP, Some(Path::new("/maps"))).unwrap();
        assert_eq!(map.entries.len(), 2);

        let board = map.select(None, Some("nrf52840dk/nrf52840")).unwrap();
        assert_eq!(board.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(board.flash_timeout, Some(90));
        assert!(board.post_flash_script.as_ref().unwrap().is_absolute());

        // Disconnected boards are never selected.
        assert!(map.select(Some("0001"), None).is_err());
        assert!(map.select(None, None).is_err());
    }
}
