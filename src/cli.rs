//! Command-line surface (A1, spec.md §6 "CLI").

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "trapsupd", version, about = "Process supervisor and control plane for modular stream-processing workers")]
pub struct Cli {
    /// Configuration template; must end in `.xml`.
    #[arg(short = 'T', long = "config-template")]
    pub config_template: PathBuf,

    /// Working directory for the generated and last-running configuration copies.
    #[arg(short = 'C', long = "configs-path", default_value = "/var/lib/trapsupd")]
    pub configs_path: PathBuf,

    /// Detach and run under the control socket.
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Override the control socket path.
    #[arg(short = 's', long = "daemon-socket", default_value = "/var/run/trapsupd.sock")]
    pub daemon_socket: PathBuf,

    /// Base directory for logs; `<DIR>/modules_logs/` is created alongside it.
    #[arg(short = 'L', long = "logs-path", default_value = "/var/log/trapsupd")]
    pub logs_path: PathBuf,

    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_validated() -> anyhow::Result<Self> {
        let cli = Self::parse();
        if cli.config_template.extension().and_then(|e| e.to_str()) != Some("xml") {
            anyhow::bail!(
                "--config-template must end in .xml, got {}",
                cli.config_template.display()
            );
        }
        Ok(cli)
    }
}
