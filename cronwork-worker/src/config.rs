use std::path::PathBuf;

use clap::Parser;
use cronwork_mailer::SmtpConfig;
use cronwork_models::errors::SendableError;

#[derive(Debug, Clone)]
pub struct Config {
    pub command_bind: String,
    pub command_port: u16,
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    pub addr: String,
    pub task_chan_size: usize,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[arg(long, default_value = "0.0.0.0")]
    command_bind: String,

    #[arg(long, default_value_t = 7200)]
    command_port: u16,

    /// Persisted task map.
    #[arg(long, default_value = "tasks.json")]
    store_path: PathBuf,

    /// Directory for per-task log files.
    #[arg(long, default_value = "logs")]
    log_path: PathBuf,

    /// Worker identity used in mail subject lines; defaults to
    /// command_bind:command_port.
    #[arg(long, default_value = "")]
    addr: String,

    /// Bound on pending commands of each kind.
    #[arg(long, default_value_t = 64)]
    task_chan_size: usize,

    #[arg(long)]
    smtp_host: Option<String>,

    #[arg(long, default_value_t = 587)]
    smtp_port: u16,

    #[arg(long, default_value = "")]
    smtp_user: String,

    #[arg(long, default_value = "")]
    smtp_pass: String,

    #[arg(long, default_value = "")]
    mail_from: String,
}

pub fn parse_config() -> Result<Config, SendableError> {
    let args = CliArgs::try_parse()?;

    let addr = if args.addr.trim().is_empty() {
        format!("{}:{}", args.command_bind, args.command_port)
    } else {
        args.addr
    };

    let smtp = args.smtp_host.map(|host| SmtpConfig {
        host,
        port: args.smtp_port,
        username: args.smtp_user,
        password: args.smtp_pass,
        from: args.mail_from,
    });

    Ok(Config {
        command_bind: args.command_bind,
        command_port: args.command_port,
        store_path: args.store_path,
        log_path: args.log_path,
        addr,
        task_chan_size: args.task_chan_size,
        smtp,
    })
}
