//! Anonboard CLI
//!
//! Command-line interface for the anonymous posting relay

mod logging;

use anonboard_config::Config;
use anonboard_core::BoardRuntime;
use anonboard_discord::DiscordClient;
use anonboard_storage::Storage;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const PID_FILE: &str = "anonboard.pid";
const DB_FILE: &str = "anonboard.db";

#[derive(Parser)]
#[command(name = "anonboard")]
#[command(about = "Anonymous posting relay for a Discord guild", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level; falls back to `core.log_level`, then `info`. RUST_LOG wins.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground
    Start,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show the most recently persisted messages
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Log file commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },

    /// Connectivity checks
    Test {
        #[command(subcommand)]
        action: TestCommands,
    },

    /// Show version
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the configuration with secrets redacted
    Show,
    /// Check the configuration for errors
    Validate,
}

#[derive(Subcommand)]
enum LogCommands {
    /// List log files
    List,
    /// Print the end of today's log
    Tail {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Delete log files past retention
    Clean,
}

#[derive(Subcommand)]
enum TestCommands {
    /// Verify the bot token against the Discord API
    Discord,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config.as_deref())?;
            let data_dir = config.data_dir();
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("failed to create {}", data_dir.display()))?;

            let pid_path = data_dir.join(PID_FILE);
            let current_pid = std::process::id();
            if let Some(running_pid) = check_running(&pid_path)? {
                if running_pid != current_pid {
                    return Err(anyhow!("Anonboard is already running (PID: {})", running_pid));
                }
            }

            let log_level = cli
                .log_level
                .or_else(|| config.core.log_level.clone())
                .unwrap_or_else(|| "info".to_string());
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            let storage = Storage::new(data_dir.join(DB_FILE))?;
            let runtime = BoardRuntime::new(config, storage)?;
            write_pid_file(&pid_path, current_pid)?;
            info!("Starting Anonboard runtime in foreground...");
            let run_result = runtime.run().await;
            clear_pid_file_if_owned(&pid_path, current_pid);
            run_result?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                let config = load_config(cli.config.as_deref())?;
                println!("Current configuration:");
                print_redacted_config(&config)?;
            }
            ConfigCommands::Validate => {
                match load_config(cli.config.as_deref()).and_then(|config| config.validate()) {
                    Ok(()) => println!("Configuration is valid."),
                    Err(e) => {
                        eprintln!("Configuration is invalid: {:#}", e);
                        std::process::exit(1);
                    }
                }
            }
        },

        Commands::History { limit } => {
            let config = load_config(cli.config.as_deref())?;
            let db_path = config.data_dir().join(DB_FILE);
            if !db_path.exists() {
                println!("No message history at {}", db_path.display());
                return Ok(());
            }
            let storage = Storage::new(&db_path)?;
            let total = storage.count_messages()?;
            let recent = storage.list_recent(limit)?;
            println!("{} message(s) stored, showing {}:\n", total, recent.len());
            for message in recent {
                println!(
                    "  #{} {} sender={}: {}",
                    message.id, message.timestamp, message.sender, message.content
                );
            }
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config.as_deref())?;
            let logs = logging::LogDirectory::new(config.data_dir().join("logs"));
            match action {
                LogCommands::List => {
                    let files = logs.files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::format_size(logs.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        let name = file
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        println!(
                            "  {} ({}, modified {})",
                            name,
                            logging::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Tail { lines } => {
                    let current = logs.today_path();
                    if current.exists() {
                        for line in logging::LogDirectory::tail(&current, lines)? {
                            println!("{}", line);
                        }
                    } else {
                        println!("No log file found at {}", current.display());
                    }
                }
                LogCommands::Clean => {
                    let deleted = logs.prune(logging::retention())?;
                    println!(
                        "Cleaned {} log file(s) older than {} days",
                        deleted,
                        logging::LOG_RETENTION_DAYS
                    );
                }
            }
        }

        Commands::Test { action } => match action {
            TestCommands::Discord => {
                println!("Testing Discord bot connection...\n");
                let config = load_config(cli.config.as_deref())?;
                test_discord(&config).await?;
            }
        },

        Commands::Version => {
            println!("anonboard {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        Config::load(path)
    } else if let Some(default_path) = Config::default_path() {
        Config::load(&default_path)
    } else {
        anyhow::bail!("No config file found")
    }
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(token) = value
        .get_mut("discord")
        .and_then(|d| d.get_mut("bot_token"))
        .filter(|t| !t.is_null())
    {
        *token = json!("***REDACTED***");
    }
    Ok(value)
}

fn print_redacted_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&redacted_config(config)?)?);
    Ok(())
}

async fn test_discord(config: &Config) -> Result<()> {
    let discord = &config.discord;
    let token = discord
        .resolved_token()
        .ok_or_else(|| anyhow!("No bot token in config or DISCORD_BOT_TOKEN"))?;
    let client = DiscordClient::new(&token, &discord.api_base, discord.guild_id)?;
    match client.get_current_user().await {
        Ok(user) => {
            println!("  OK  authenticated as {} (id {})", user.username, user.id);
            Ok(())
        }
        Err(e) => {
            println!("  FAIL {}", e);
            Err(e.into())
        }
    }
}

fn write_pid_file(pid_path: &Path, pid: u32) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    fs::write(pid_path, format!("{}\n{}", pid, timestamp))
        .with_context(|| format!("failed to write {}", pid_path.display()))?;
    Ok(())
}

fn read_pid(pid_path: &Path) -> Option<u32> {
    fs::read_to_string(pid_path)
        .ok()?
        .lines()
        .next()
        .and_then(|value| value.trim().parse().ok())
}

fn clear_pid_file_if_owned(pid_path: &Path, pid: u32) {
    if read_pid(pid_path) == Some(pid) {
        let _ = fs::remove_file(pid_path);
    }
}

/// A stale PID file (process gone) counts as not running.
fn check_running(pid_path: &Path) -> Result<Option<u32>> {
    if !pid_path.exists() {
        return Ok(None);
    }
    Ok(read_pid(pid_path).filter(|pid| is_process_running(*pid)))
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn sample_config(token: Option<&str>) -> Config {
        let mut config = Config::default();
        config.discord.bot_token = token.map(str::to_string);
        config.discord.guild_id = 983702974792613969;
        config
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_history_limit() {
        let cli = Cli::try_parse_from(["anonboard", "history", "--limit", "5"]).expect("parse");
        assert!(matches!(cli.command, Commands::History { limit: 5 }));
        assert_eq!(cli.log_level, None);
    }

    #[test]
    fn parses_logs_tail_with_global_config() {
        let cli = Cli::try_parse_from([
            "anonboard",
            "--config",
            "/tmp/anonboard.toml",
            "logs",
            "tail",
            "-n",
            "10",
        ])
        .expect("parse");
        assert_eq!(cli.config.as_deref(), Some("/tmp/anonboard.toml"));
        assert!(matches!(
            cli.command,
            Commands::Logs {
                action: LogCommands::Tail { lines: 10 }
            }
        ));
    }

    #[test]
    fn redacts_bot_token() {
        let value = redacted_config(&sample_config(Some("secret-token"))).expect("redact");
        assert_eq!(value["discord"]["bot_token"], json!("***REDACTED***"));
        assert_eq!(value["discord"]["guild_id"], json!(983702974792613969u64));
        assert!(!value.to_string().contains("secret-token"));
    }

    #[test]
    fn absent_token_stays_null() {
        let value = redacted_config(&sample_config(None)).expect("redact");
        assert!(value["discord"]["bot_token"].is_null());
    }

    #[test]
    fn pid_file_is_cleared_only_by_owner() {
        let dir = std::env::temp_dir().join(format!("anonboard-pid-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create dir");
        let pid_path = dir.join(PID_FILE);

        write_pid_file(&pid_path, 4242).expect("write");
        assert_eq!(read_pid(&pid_path), Some(4242));
        clear_pid_file_if_owned(&pid_path, 1);
        assert!(pid_path.exists());
        clear_pid_file_if_owned(&pid_path, 4242);
        assert!(!pid_path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_pid_file_means_not_running() {
        let pid_path = std::env::temp_dir().join("anonboard-no-such.pid");
        assert_eq!(check_running(&pid_path).expect("check"), None);
    }
}
