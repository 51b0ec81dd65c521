/// Subprocess helpers shared by the adapters and the Babblesim driver.
use std::{
    collections::HashSet,
    io::{self, Read},
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use sysinfo::{ProcessesToUpdate, System};

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Render a command line for logs and return it.
///
/// On Unix the result can be pasted into a shell; on Windows it is the raw
/// argument list.
pub fn log_command<S: AsRef<str>>(description: &str, args: &[S]) -> String {
    let rendered = if cfg!(windows) {
        format!("{:?}", args.iter().map(AsRef::as_ref).collect::<Vec<_>>())
    } else {
        args.iter()
            .map(|arg| shell_quote(arg.as_ref()))
            .collect::<Vec<_>>()
            .join(" ")
    };
    log::debug!("{description}: {rendered}");
    rendered
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

/// Every live descendant of `root`, deepest first.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            let pid = pid.as_u32();
            if process.parent().map(|p| p.as_u32()) == Some(parent) && seen.insert(pid) {
                found.push(pid);
                frontier.push(pid);
            }
        }
    }
    found.reverse();
    found
}

fn signal(pid: u32, sig: Signal) {
    if let Err(err) = kill(Pid::from_raw(pid as i32), sig) {
        log::debug!("kill({pid}, {sig}) failed: {err}");
    }
}

/// Terminate `child` and everything it spawned.
///
/// Descendants get SIGTERM first, then the child. After `grace` any survivor
/// gets SIGKILL. The child is always reaped; its exit status is returned when
/// it could be collected.
pub fn terminate_process(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    let root = child.id();
    let tree = descendants(root);
    log::debug!("Terminating process {root} and descendants {tree:?}");
    for &pid in &tree {
        signal(pid, Signal::SIGTERM);
    }
    signal(root, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            kill_survivors(&tree);
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    log::warn!("Process {root} did not exit within {grace:?}, killing it");
    kill_survivors(&tree);
    if let Err(err) = child.kill() {
        log::debug!("kill of process {root} failed: {err}");
    }
    child.wait().ok()
}

/// Result of [`run_with_timeout`].
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the process had to be killed.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `command` in its own process group, capturing stdout and stderr.
///
/// When `timeout` expires the whole process group is killed.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> io::Result<CommandOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let stdout = child.stdout.take().map(capture);
    let stderr = child.stderr.take().map(capture);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            timed_out = true;
            log::warn!("Process {} timed out after {timeout:?}", child.id());
            if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
                log::debug!("killpg({}) failed: {err}", child.id());
            }
            child.wait()?;
            break None;
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    let collect = |handle: Option<JoinHandle<Vec<u8>>>| {
        handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };
    Ok(CommandOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
        timed_out,
    })
}

fn capture(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut data = Vec::new();
        if let Err(err) = pipe.read_to_end(&mut data) {
            log::debug!("Reading subprocess output failed: {err}");
        }
        data
    })
}

fn kill_survivors(tree: &[u32]) {
    let alive: HashSet<u32> = {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system.processes().keys().map(|pid| pid.as_u32()).collect()
    };
    for pid in tree.iter().filter(|pid| alive.contains(pid)) {
        signal(*pid, Signal::SIGKILL);
    }
}
