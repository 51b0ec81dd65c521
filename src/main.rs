use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction};
use regex::Regex;

use twister_harness::{
    boot, cli,
    fixtures::Session,
    helpers::Shell,
};

fn main() {
    boot::init_logger();
    if let Err(err) = run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = cli::harness_args(
        clap::Command::new("twister-harness")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Launch a Zephyr application and talk to its console"),
    )
    .arg(
        Arg::new("test-name")
            .long("test-name")
            .help("Name used for the log files of this run")
            .value_name("NAME")
            .default_value("twister_harness"),
    )
    .arg(
        Arg::new("shell-command")
            .long("shell-command")
            .help("Shell command to run once the prompt shows up, may be repeated")
            .value_name("COMMAND")
            .action(ArgAction::Append),
    )
    .arg(
        Arg::new("expect")
            .long("expect")
            .help("Regex that the output of every shell command must match")
            .value_name("REGEX"),
    )
    .get_matches();

    let Some(config) = cli::config_from_matches(&matches)? else {
        bail!("harness is disabled, pass --twister-harness");
    };
    let expect = matches
        .get_one::<String>("expect")
        .map(|pattern| Regex::new(pattern))
        .transpose()
        .context("invalid --expect pattern")?;
    let commands: Vec<&String> = matches
        .get_many::<String>("shell-command")
        .map(Iterator::collect)
        .unwrap_or_default();
    let test_name = matches
        .get_one::<String>("test-name")
        .map(String::as_str)
        .unwrap_or("twister_harness");

    let shell_timeout = config.shell_timeout;
    let mut session = Session::new(config)?;
    let dut = session.dut(test_name)?;

    if commands.is_empty() {
        // Without commands, follow the console until it ends.
        for line in dut.iter_stdout()? {
            println!("{line}");
        }
        return Ok(());
    }

    let shell = Shell::new(&dut).with_timeout(shell_timeout);
    if !shell.wait_for_prompt(None)? {
        bail!("shell prompt `{}` was not seen", shell.prompt());
    }
    for command in commands {
        let lines = match &expect {
            Some(pattern) => shell.exec_command_and_assert(command, pattern, None)?,
            None => shell.exec_command(command, None)?,
        };
        for line in shell.filtered_output(&lines) {
            println!("{line}");
        }
    }
    Ok(())
}
