#![allow(dead_code)]

use std::path::{Path, PathBuf};

use twister_harness::{DeviceConfig, DeviceType, TwisterHarnessConfig};

/// `/bin/sh` program playing a Zephyr application with the shell enabled.
pub const FAKE_SHELL: &str = r#"
echo "*** Booting Zephyr OS build v3.7.0 ***"
printf 'uart:~$ \n'
while IFS= read -r line; do
    case "$line" in
        "") ;;
        help)
            echo "help"
            echo "Please press the <Tab> button to see all available commands."
            echo "Available commands:"
            echo "  kernel  : Kernel commands"
            echo "  mpu     : MPU tests"
            ;;
        "kernel version")
            echo "kernel version"
            echo "Zephyr version 3.7.0"
            ;;
        "mpu mtest "*)
            echo "$line"
            echo "The value is: 0x0000ab12"
            ;;
        exit)
            exit 0
            ;;
        *)
            echo "$line"
            echo "$line: command not found"
            ;;
    esac
    printf 'uart:~$ \n'
done
"#;

/// Write `body` as a shell script under `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    path
}

/// Custom device running `script` through `/bin/sh`.
///
/// Going through the interpreter avoids executing a file this process just
/// wrote, which can fail with ETXTBSY while other tests fork.
pub fn custom_device(script: &Path, build_dir: Option<&Path>) -> DeviceConfig {
    let mut device = DeviceConfig::new(DeviceType::Custom).with_binary_file("/bin/sh");
    device.extra_args = vec![script.to_string_lossy().into_owned()];
    device.build_dir = build_dir.map(Path::to_path_buf);
    device
}

pub fn fake_shell_config(dir: &Path) -> TwisterHarnessConfig {
    let script = write_script(dir, "zephyr_shell.sh", FAKE_SHELL);
    TwisterHarnessConfig::new(custom_device(&script, Some(dir)))
}
