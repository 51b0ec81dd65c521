/// Test fixtures
///
/// [`Session`] holds the parsed configuration and the device adapter for a
/// whole test session. [`Session::dut`] launches the device for one test and
/// hands out a [`Dut`] guard that closes it again when dropped.
///
/// ```no_run
/// # fn main() -> twister_harness::error::Result<()> {
/// use twister_harness::fixtures::{parse_config, Session};
///
/// let args = std::env::args().skip(1);
/// if let Some(config) = parse_config(args)? {
///     let mut session = Session::new(config)?;
///     let dut = session.dut("test_shell_help")?;
///     let shell = dut.shell()?;
///     shell.exec_command("help", None)?;
/// }
/// # Ok(())
/// # }
/// ```
use std::ops::{Deref, DerefMut};

use twister_smp::{L2capTransport, SerialTransport, SmpClient, Transport, UdpTransport};

use crate::{
    cli,
    config::{McumgrTransport, TwisterHarnessConfig},
    device::DeviceAdapter,
    error::{HarnessError, Result},
    helpers::Shell,
};

/// Parse harness options from `args` (without the program name).
///
/// Returns `None` when `--twister-harness` is not given.
pub fn parse_config<I, T>(args: I) -> Result<Option<TwisterHarnessConfig>>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = cli::build_command()
        .try_get_matches_from(args)
        .map_err(|err| HarnessError::config(err.to_string()))?;
    cli::config_from_matches(&matches)
}

pub struct Session {
    config: TwisterHarnessConfig,
    device: DeviceAdapter,
}

impl Session {
    /// Construct the adapter for the main device without launching it.
    pub fn new(config: TwisterHarnessConfig) -> Result<Self> {
        let device = DeviceAdapter::new(config.main_device()?.clone())?;
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &TwisterHarnessConfig {
        &self.config
    }

    pub fn device_object(&mut self) -> &mut DeviceAdapter {
        &mut self.device
    }

    /// Route logs to `test_name` and launch the device.
    pub fn dut(&mut self, test_name: &str) -> Result<Dut<'_>> {
        self.device.initialize_log_files(test_name);
        self.device.launch()?;
        Ok(Dut {
            device: &mut self.device,
            config: &self.config,
        })
    }
}

/// A launched device, closed when the guard goes out of scope.
pub struct Dut<'a> {
    device: &'a mut DeviceAdapter,
    config: &'a TwisterHarnessConfig,
}

impl<'a> Dut<'a> {
    /// Shell bound to this device, ready at the prompt.
    pub fn shell(&self) -> Result<Shell<'_>> {
        let shell = Shell::new(&*self.device).with_timeout(self.config.shell_timeout);
        if !shell.wait_for_prompt(None)? {
            return Err(HarnessError::timeout(
                format!("shell prompt `{}` was not seen", shell.prompt()),
                Vec::new(),
            ));
        }
        Ok(shell)
    }

    /// Open an SMP client on the configured transport.
    pub fn mcumgr(&self) -> Result<SmpClient<Box<dyn Transport>>> {
        let mcumgr = &self.config.mcumgr;
        let transport: Box<dyn Transport> = match mcumgr.transport {
            McumgrTransport::Serial => {
                let port = mcumgr
                    .serial
                    .as_deref()
                    .or_else(|| self.device.config().serial.first().map(String::as_str))
                    .ok_or_else(|| {
                        HarnessError::config("--mcumgr-serial is required without a device serial port")
                    })?;
                Box::new(SerialTransport::new(port, self.device.config().baud))
            }
            McumgrTransport::Udp => Box::new(UdpTransport::new(&mcumgr.udp_addr)),
            McumgrTransport::L2cap => {
                let address = mcumgr
                    .l2cap_addr
                    .as_deref()
                    .ok_or_else(|| HarnessError::config("--mcumgr-l2cap-addr is required"))?;
                Box::new(L2capTransport::new(address, mcumgr.l2cap_psm))
            }
        };
        log::info!("Opening mcumgr client over {}", mcumgr.transport);
        let mut client = SmpClient::new(transport).with_timeout(mcumgr.timeout);
        client.open()?;
        Ok(client)
    }
}

impl Deref for Dut<'_> {
    type Target = DeviceAdapter;

    fn deref(&self) -> &Self::Target {
        &*self.device
    }
}

impl DerefMut for Dut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.device
    }
}

impl Drop for Dut<'_> {
    fn drop(&mut self) {
        self.device.close();
    }
}
