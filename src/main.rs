use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use container_attach::config::{Config, ConfigStore, SettingKey};
use container_attach::logging::init_tracing;
use container_attach::{run_attached, AttachConfig, HostStdio};

#[derive(Debug, Parser)]
#[command(name = "container-attach", version, about = "Attach host stdio to a process")]
struct Cli {
    /// Settings file (default: ~/.config/container-attach/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command with its stdio attached to this terminal
    Attach(AttachArgs),
    /// Read or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Debug, Args)]
struct AttachArgs {
    /// Attach a terminal (stderr is merged into it)
    #[arg(short = 't', long)]
    tty: bool,

    /// Forward stdin to the process
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Do not capture stdout/stderr
    #[arg(short = 'd', long)]
    detach: bool,

    /// Override the output drain timeout in milliseconds
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Command and arguments to run
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    /// Print one setting
    Get { key: String },
    /// Change one setting and save it
    Set { key: String, value: String },
    /// Print every setting
    List,
    /// Print the settings file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Attach(args) => {
            let code = attach(args, path).await?;
            std::process::exit(code)
        }
        Commands::Settings { action } => settings(action, path),
    }
}

async fn attach(args: AttachArgs, path: PathBuf) -> anyhow::Result<i32> {
    let config = Config::load_from(&path).context("Failed to load settings")?;
    let drain_timeout = args
        .drain_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.attach.drain_timeout());

    let attach = AttachConfig {
        tty: args.tty,
        interactive: args.interactive,
        detach: args.detach,
    };
    let code = run_attached(attach, HostStdio::default(), &args.command, drain_timeout)
        .await
        .with_context(|| format!("Failed to attach to '{}'", args.command.join(" ")))?;
    Ok(code)
}

fn settings(action: SettingsAction, path: PathBuf) -> anyhow::Result<()> {
    let store = ConfigStore::open(path)?;
    match action {
        SettingsAction::Get { key } => {
            let key: SettingKey = key.parse()?;
            println!("{}", store.setting(key));
        }
        SettingsAction::Set { key, value } => {
            let key: SettingKey = key.parse()?;
            store.set(key, &value)?;
        }
        SettingsAction::List => {
            let config = store.get();
            for (key, value) in config.entries() {
                println!("{} = {}", key, value);
            }
            if !config.executable_exists() {
                eprintln!(
                    "Warning: runtime executable not found at {}",
                    config.runtime.executable_path.display()
                );
            }
        }
        SettingsAction::Path => println!("{}", store.path().display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_flags_parse_like_docker() {
        let cli = Cli::try_parse_from(["container-attach", "attach", "-it", "--", "sh", "-c", "true"])
            .unwrap();
        let Commands::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        assert!(args.tty);
        assert!(args.interactive);
        assert!(!args.detach);
        assert_eq!(args.command, vec!["sh", "-c", "true"]);
    }

    #[test]
    fn attach_requires_a_command() {
        assert!(Cli::try_parse_from(["container-attach", "attach", "-d"]).is_err());
    }
}
