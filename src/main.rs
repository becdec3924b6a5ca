//! spm - Main entry point.
//!
//! Usage:
//!   spm inspect <URL> [--api-level N]
//!   spm install <URL> <DIR> [--api-level N] [--force]
//!
//! Options:
//!   --version, -v    Show version
//!   --help, -h       Show this help
//!
//! Ctrl-C while downloading cancels the fetch.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use spm::config::Config;
use spm::logging;
use spm::metadata::Inspector;
use spm::package::{
    InstallOutcome, PackageDescriptor, PackageDownloader, PackageInstaller, ReadinessIssue,
    assess, format_size,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "Usage:
  spm inspect <URL> [--api-level N]
  spm install <URL> <DIR> [--api-level N] [--force]

Options:
  --api-level N    Host API level to check the manifest against
  --force          Install even when readiness checks fail
  --version, -v    Show version
  --help, -h       Show this help";

/// Parsed command line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Inspect {
        url: String,
        api_level: Option<i32>,
    },
    Install {
        url: String,
        target: PathBuf,
        api_level: Option<i32>,
        force: bool,
    },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut positional = Vec::new();
        let mut api_level = None;
        let mut force = false;

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--force" => force = true,
                "--api-level" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| "--api-level needs a value".to_string())?;
                    let level = value
                        .parse()
                        .map_err(|_| format!("Invalid API level: {}", value))?;
                    api_level = Some(level);
                }
                flag if flag.starts_with("--") => return Err(format!("Unknown option: {}", flag)),
                _ => positional.push(arg.as_str()),
            }
        }

        match positional[..] {
            ["inspect", url] => Ok(Self::Inspect {
                url: url.to_string(),
                api_level,
            }),
            ["install", url, target] => Ok(Self::Install {
                url: url.to_string(),
                target: PathBuf::from(target),
                api_level,
                force,
            }),
            [] => Err("Missing command".to_string()),
            [command, ..] => Err(format!("Invalid arguments for '{}'", command)),
        }
    }

    fn url(&self) -> &str {
        match self {
            Self::Inspect { url, .. } | Self::Install { url, .. } => url,
        }
    }

    fn api_level(&self) -> Option<i32> {
        match self {
            Self::Inspect { api_level, .. } | Self::Install { api_level, .. } => *api_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("spm v{}", VERSION);
        return Ok(ExitCode::SUCCESS);
    }

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(ExitCode::SUCCESS);
    }

    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{}\n\n{}", message, USAGE);
            return Ok(ExitCode::from(2));
        }
    };

    let config = Config::load()?;

    // Held until exit so buffered log lines are flushed
    let _log_guard = logging::init(&config.log).unwrap_or_else(|e| {
        eprintln!("Warning: file logging disabled: {}", e);
        None
    });

    let downloader = PackageDownloader::new(
        config.download.clone(),
        Inspector::new(config.plugin.contract()),
    );

    println!("Downloading {}...", command.url());
    let Some(descriptor) = fetch_with_interrupt(&downloader, command.url()).await else {
        return Ok(ExitCode::FAILURE);
    };

    print_descriptor(&descriptor);
    let issues = assess(
        &descriptor,
        command.api_level().or(config.plugin.host_api_level),
    );
    print_issues(&descriptor, &issues);

    let Command::Install { target, force, .. } = command else {
        return Ok(ExitCode::SUCCESS);
    };

    if !issues.is_empty() && !force {
        eprintln!("Not installing because of the problems above. Use --force to install anyway.");
        return Ok(ExitCode::FAILURE);
    }

    println!("Installing into {}...", target.display());
    let outcome = tokio::task::spawn_blocking(move || {
        PackageInstaller::default().install_with(&descriptor, &target, |message| {
            eprintln!("  {}", message);
        })
    })
    .await?;

    print_outcome(&outcome);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Runs a fetch, canceling it on Ctrl-C.
async fn fetch_with_interrupt(downloader: &PackageDownloader, url: &str) -> Option<PackageDescriptor> {
    let fetch = downloader.fetch(url, |message| eprintln!("Download failed: {}", message));
    tokio::pin!(fetch);

    loop {
        tokio::select! {
            result = &mut fetch => return result,
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    return (&mut fetch).await;
                }
                eprintln!("Canceling...");
                downloader.cancel();
            }
        }
    }
}

fn print_descriptor(descriptor: &PackageDescriptor) {
    println!();
    println!("Downloaded plugin: {}", descriptor.display_name());
    println!("Main file: {}", descriptor.main_member_name());
    println!();
    println!("{:<40} {:>10}  {:<12} {}", "File", "Size", "Version", "Platform");
    for file in descriptor.files() {
        println!(
            "{:<40} {:>10}  {:<12} {}",
            file.name,
            format_size(file.size_bytes),
            file.version.as_deref().unwrap_or("-"),
            file.platform
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string)
        );
    }
    println!();
}

fn print_issues(descriptor: &PackageDescriptor, issues: &[ReadinessIssue]) {
    if issues.is_empty() {
        let version = descriptor
            .manifest()
            .and_then(|manifest| manifest.assembly_version)
            .map(|version| format!(" v{}", version))
            .unwrap_or_default();
        println!(
            "Plugin {}{} has passed all checks and is ready for installation.",
            descriptor.display_name(),
            version
        );
        return;
    }

    for issue in issues {
        println!("[!] {}", issue);
    }
}

fn print_outcome(outcome: &InstallOutcome) {
    match outcome {
        InstallOutcome::Installed(report) => {
            println!(
                "Installed {} files ({} stale files recycled).",
                report.written.len(),
                report.recycled.len()
            );
        }
        InstallOutcome::Partial(report) => {
            eprintln!(
                "Installed {} files with {} failures.",
                report.written.len(),
                report.failures.len()
            );
        }
        InstallOutcome::Rejected(error) => eprintln!("Install failed: {}", error),
    }
}
