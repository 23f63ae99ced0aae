//! Top-level CLI definition and dispatch.

use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use vreserve::client::volume_client::VolumeClient;
use vreserve::core::config::Config;
use vreserve::core::errors::VrError;
use vreserve::core::paths::absolutize_request_path;
use vreserve::daemon::loop_main::run_daemon;

/// vreserve: reserve local disk space before disk-heavy work.
#[derive(Debug, Parser)]
#[command(
    name = "vreserve",
    author,
    version,
    about = "Local disk-space reservation service",
    long_about = "vreserve keeps track of how much disk space is promised on each mounted volume. \
Workers reserve space before tasks that need large amounts of disk and release it when done.",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the reservation service in the foreground (Ctrl-C or SIGTERM stops it).
    Serve(ServeArgs),
    /// Reserve space for a path on the volume that holds it.
    Reserve(ReserveArgs),
    /// Release the reservation held for a path.
    Release(PathArgs),
    /// List reservations on the volume holding a path.
    Report(PathArgs),
    /// Check that the service is reachable.
    Ping(ClientArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Host to listen on: 127.0.0.1 for local requests only, 0.0.0.0 for all.
    #[arg(short = 'H', long)]
    host: Option<String>,
    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,
    /// JSONL activity log file (default: stdout).
    #[arg(short = 'l', long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Number of HTTP worker threads.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct ClientArgs {
    /// Service base URL (default: client.service_url from config).
    #[arg(long, value_name = "URL")]
    url: Option<String>,
    /// Request timeout in milliseconds (default: client.timeout_ms from config).
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct PathArgs {
    /// File or directory the reservation is for.
    path: PathBuf,
    /// Send the path exactly as given instead of making it absolute.
    #[arg(long)]
    raw: bool,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Clone, Args)]
struct ReserveArgs {
    #[command(flatten)]
    target: PathArgs,
    /// Amount to reserve: plain bytes or a size with a binary unit (512K, 10GiB).
    #[arg(value_parser = parse_byte_size)]
    bytes: u64,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file location.
    Path,
    /// Print the effective configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input.
    #[error("{0}")]
    User(String),
    /// Environment or service failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<VrError> for CliError {
    fn from(error: VrError) -> Self {
        match &error {
            VrError::InvalidArgument { .. }
            | VrError::InvalidConfig { .. }
            | VrError::MissingConfig { .. }
            | VrError::ConfigParse { .. } => Self::User(error.to_string()),
            VrError::Rejected { status, .. } if (400..500).contains(status) && *status != 409 => {
                Self::User(error.to_string())
            }
            VrError::Serialization { .. } => Self::Internal(error.to_string()),
            _ => Self::Runtime(error.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Serve(args) => run_serve(cli, args),
        Command::Reserve(args) => run_reserve(cli, args),
        Command::Release(args) => run_release(cli, args),
        Command::Report(args) => run_report(cli, args),
        Command::Ping(args) => run_ping(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn run_serve(cli: &Cli, args: &ServeArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(log_file) = &args.log_file {
        config.logging.log_file = Some(log_file.clone());
    }
    if let Some(workers) = args.workers {
        config.server.worker_threads = workers;
    }
    config.validate()?;

    let mode = output_mode(cli);
    let log_target = config
        .logging
        .log_file
        .as_ref()
        .map_or_else(|| "stdout".to_string(), |path| path.display().to_string());
    let mut ready_error: Option<CliError> = None;

    run_daemon(&config, |addr: SocketAddr| {
        let outcome = match mode {
            OutputMode::Human => {
                println!("{} is listening on {addr}", "vreserve".bold());
                println!("  Logging to {log_target}");
                println!("  To test: curl http://{addr}/ping/");
                println!("  Use Ctrl-C to stop");
                io::stdout().flush().map_err(CliError::from)
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "serve",
                "listen": addr.to_string(),
                "log": log_target,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        };
        if let Err(error) = outcome {
            ready_error = Some(error);
        }
    })?;

    ready_error.map_or(Ok(()), Err)
}

fn run_reserve(cli: &Cli, args: &ReserveArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let client = client_for(&config, &args.target.client);
    let path = request_path(&args.target);

    let reserved = client.reserve(&path, args.bytes)?;
    if !reserved {
        return Err(CliError::Runtime(format!(
            "service did not confirm the reservation for {path}"
        )));
    }

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{} {} for {path}",
                "Reserved".green().bold(),
                format_bytes(args.bytes)
            );
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "reserve",
            "path": path,
            "bytes": args.bytes,
            "reserved": true,
        }))?,
    }
    Ok(())
}

fn run_release(cli: &Cli, args: &PathArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let client = client_for(&config, &args.client);
    let path = request_path(args);

    client.release(&path)?;

    match output_mode(cli) {
        OutputMode::Human => println!("{} {path}", "Released".green().bold()),
        OutputMode::Json => write_json_line(&json!({
            "command": "release",
            "path": path,
            "released": true,
        }))?,
    }
    Ok(())
}

fn run_report(cli: &Cli, args: &PathArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let client = client_for(&config, &args.client);
    let path = request_path(args);

    let reservations = client.report(&path)?;
    let total = reservations
        .values()
        .fold(0_u64, |acc, bytes| acc.saturating_add(*bytes));

    match output_mode(cli) {
        OutputMode::Human => print_report(&path, &reservations, total),
        OutputMode::Json => write_json_line(&json!({
            "command": "report",
            "path": path,
            "reservations": reservations,
            "total_bytes": total,
        }))?,
    }
    Ok(())
}

fn print_report(path: &str, reservations: &BTreeMap<String, u64>, total: u64) {
    if reservations.is_empty() {
        println!("No reservations on the volume holding {path}.");
        return;
    }
    let width = reservations.keys().map(String::len).max().unwrap_or(0);
    println!("{}", format!("Reservations on the volume holding {path}:").bold());
    for (reserved_path, bytes) in reservations {
        println!("  {reserved_path:<width$}  {:>12}", format_bytes(*bytes));
    }
    println!(
        "  {:<width$}  {:>12}",
        "total".bold(),
        format_bytes(total).bold()
    );
}

fn run_ping(cli: &Cli, args: &ClientArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let client = client_for(&config, args);
    let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(config.client.timeout_ms));

    let started = Instant::now();
    client.ping(timeout)?;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match output_mode(cli) {
        OutputMode::Human => println!(
            "{} {} answered in {elapsed_ms} ms",
            "OK".green().bold(),
            client.base_url()
        ),
        OutputMode::Json => write_json_line(&json!({
            "command": "ping",
            "url": client.base_url(),
            "reachable": true,
            "elapsed_ms": elapsed_ms,
        }))?,
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                let source = config
                    .source
                    .as_deref()
                    .map_or_else(|| "(defaults)".to_string(), |p| p.display().to_string());

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("{}", "Configuration is valid.".green());
                        println!("  Source: {source}");
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "source": source,
                        "hash": hash,
                    }))?,
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("{} {e}", "Configuration is INVALID:".red()),
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "error": e.to_string(),
                        "code": e.code(),
                    }))?,
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn client_for(config: &Config, args: &ClientArgs) -> VolumeClient {
    let url = args
        .url
        .clone()
        .unwrap_or_else(|| config.client.service_url.clone());
    let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(config.client.timeout_ms));
    VolumeClient::with_timeout(url, timeout)
}

fn request_path(args: &PathArgs) -> String {
    let path: &Path = &args.path;
    if args.raw {
        return path.to_string_lossy().into_owned();
    }
    absolutize_request_path(path).to_string_lossy().into_owned()
}

/// Parse `8000`, `512K`, `1.5G`, `10GiB`. Units are binary (K = 1024).
fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(format!("invalid size {raw:?}: expected a number"));
    }
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => return Err(format!("invalid size {raw:?}: unknown unit {other:?}")),
    };

    let bytes = if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|e| format!("invalid size {raw:?}: {e}"))?;
        #[allow(clippy::cast_precision_loss)]
        let scaled = value * multiplier as f64;
        if !scaled.is_finite() || scaled >= u64::MAX as f64 {
            return Err(format!("invalid size {raw:?}: too large"));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = scaled.round() as u64;
        whole
    } else {
        number
            .parse::<u64>()
            .map_err(|e| format!("invalid size {raw:?}: {e}"))?
            .checked_mul(multiplier)
            .ok_or_else(|| format!("invalid size {raw:?}: too large"))?
    };

    if bytes == 0 {
        return Err("size must be greater than zero".to_string());
    }
    Ok(bytes)
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("VRESERVE_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_accepts_short_flags() {
        let cli = Cli::try_parse_from([
            "vreserve", "serve", "-H", "0.0.0.0", "-p", "9000", "-l", "/tmp/v.jsonl",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/v.jsonl")));
    }

    #[test]
    fn reserve_requires_path_and_bytes() {
        assert!(Cli::try_parse_from(["vreserve", "reserve"]).is_err());
        assert!(Cli::try_parse_from(["vreserve", "reserve", "/tmp/x"]).is_err());
        assert!(Cli::try_parse_from(["vreserve", "reserve", "/tmp/x", "0"]).is_err());
        let cli = Cli::try_parse_from([
            "vreserve", "reserve", "/tmp/x", "4K", "--url", "http://127.0.0.1:1",
        ])
        .unwrap();
        let Command::Reserve(args) = cli.command else {
            panic!("expected reserve");
        };
        assert_eq!(args.bytes, 4096);
        assert_eq!(args.target.client.url.as_deref(), Some("http://127.0.0.1:1"));
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["vreserve", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(
            resolve_output_mode(true, Some("human"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("json"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("human"), false),
            OutputMode::Human
        );
        assert_eq!(
            resolve_output_mode(false, Some("auto"), true),
            OutputMode::Human
        );
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn parse_byte_size_valid_inputs() {
        let cases = [
            ("8000", 8000),
            ("1b", 1),
            ("4K", 4096),
            ("4KiB", 4096),
            ("2m", 2 << 20),
            ("1.5G", 3 << 29),
            ("1TB", 1 << 40),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_byte_size(input).unwrap(), expected, "input={input:?}");
        }
    }

    #[test]
    fn parse_byte_size_rejects_invalid() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("0").is_err());
        assert!(parse_byte_size("G").is_err());
        assert!(parse_byte_size("10x").is_err());
        assert!(parse_byte_size("-5").is_err());
        assert!(parse_byte_size("99999999999T").is_err());
    }

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(4096), "4.0 KiB");
        assert_eq!(format_bytes(3 << 29), "1.5 GiB");
    }

    #[test]
    fn vr_errors_map_to_exit_codes() {
        assert_eq!(
            CliError::from(VrError::invalid_argument("x")).exit_code(),
            1
        );
        assert_eq!(
            CliError::from(VrError::Rejected {
                status: 400,
                message: "bad".to_string()
            })
            .exit_code(),
            1
        );
        assert_eq!(
            CliError::from(VrError::Rejected {
                status: 409,
                message: "full".to_string()
            })
            .exit_code(),
            2
        );
        assert_eq!(
            CliError::from(VrError::Transport {
                details: "down".to_string()
            })
            .exit_code(),
            2
        );
    }
}
