mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "buslink", version, about = "buslink device diagnostics")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build");
    let result = runtime.block_on(cmd::run(cli.command, format));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_subcommand() {
        let cli = Cli::try_parse_from(["buslink", "devices"]).expect("devices args should parse");
        assert!(matches!(cli.command, Command::Devices(_)));
    }

    #[test]
    fn parses_probe_subcommand() {
        let cli = Cli::try_parse_from(["buslink", "probe", "usb:003/011", "--retries", "5"])
            .expect("probe args should parse");
        assert!(matches!(cli.command, Command::Probe(_)));
    }

    #[test]
    fn probe_requires_path() {
        let err = Cli::try_parse_from(["buslink", "probe"]).expect_err("missing path should fail");
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }
}
