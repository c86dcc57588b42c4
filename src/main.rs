use clap::{Arg, ArgAction, Command};
use colored::*;
use std::path::PathBuf;
use std::process;

use mqtt_audit::{
    output::{OutputConfig, OutputFormat, OutputManager, ReportDestination},
    AuditConfig, Orchestrator,
};

/// Soft NOFILE target: scan workers plus held ceiling connections
#[cfg(unix)]
const DESIRED_NOFILE: u64 = 65535;

// Ulimit adjustment for Unix systems
#[cfg(unix)]
fn adjust_ulimit_size() -> u64 {
    use rlimit::Resource;

    if let Ok((soft, hard)) = Resource::NOFILE.get() {
        let target = DESIRED_NOFILE.min(hard);
        if soft < target {
            if Resource::NOFILE.set(target, hard).is_ok() {
                log::info!("Raised open file limit from {} to {}", soft, target);
            } else {
                log::warn!("Failed to raise open file limit above {}", soft);
            }
        }
    }

    match Resource::NOFILE.get() {
        Ok((soft, _)) => soft,
        Err(_) => {
            log::warn!("Could not get file descriptor limit");
            DESIRED_NOFILE
        }
    }
}

#[cfg(not(unix))]
fn adjust_ulimit_size() -> u64 {
    65535
}

fn build_cli() -> Command {
    Command::new("mqtt-audit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Active security audit of an MQTT broker deployment")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (.json or .toml)")
                .default_value("config/config.json"),
        )
        .arg(
            Arg::new("report")
                .short('r')
                .long("report")
                .value_name("MODE")
                .help("Report output type")
                .value_parser(["stdout", "file"])
                .default_value("stdout"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Report file used with --report file")
                .default_value("result.txt"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .help("Report format")
                .value_parser(["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging unless RUST_LOG is set")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .help("Disable colored output")
                .action(ArgAction::SetTrue),
        )
}

fn output_config(matches: &clap::ArgMatches) -> anyhow::Result<OutputConfig> {
    let format: OutputFormat = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("text")
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let destination = match matches.get_one::<String>("report").map(String::as_str) {
        Some("file") => ReportDestination::File(PathBuf::from(
            matches
                .get_one::<String>("output")
                .map(String::as_str)
                .unwrap_or("result.txt"),
        )),
        _ => ReportDestination::Stdout,
    };

    Ok(OutputConfig {
        format,
        destination,
        colored: !matches.get_flag("no-color"),
    })
}

async fn run(matches: clap::ArgMatches) -> anyhow::Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config/config.json");

    let config = AuditConfig::from_file(config_path)?;
    let output = OutputManager::new(output_config(&matches)?);

    let fd_limit = adjust_ulimit_size();
    log::debug!("Open file limit: {}", fd_limit);

    let orchestrator = Orchestrator::new(config)?;
    let report = orchestrator.run().await?;

    println!(
        "{} {:.2?}",
        "[~] Audit completed in".bright_blue(),
        report.elapsed
    );
    output.write_report(&report)?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let default_filter = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if matches.get_flag("no-color") {
        colored::control::set_override(false);
    }

    if let Err(e) = run(matches).await {
        eprintln!("{} {:#}", "[!] Audit aborted:".bright_red().bold(), e);
        process::exit(1);
    }
}
