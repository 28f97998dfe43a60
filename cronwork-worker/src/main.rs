mod config;
mod server;

use std::sync::Arc;

use config::parse_config;
use cronwork_mailer::{LogMailer, Mailer, SmtpMailer};
use cronwork_models::errors::SendableError;
use cronwork_scheduler::{Scheduler, SchedulerConfig};
use cronwork_store::TaskStore;
use cronwork_utilities::startup;
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    startup::startup("Cronwork Worker")?;

    let config = parse_config()?;
    info!("Worker identity: {}", config.addr);

    std::fs::create_dir_all(&config.log_path)?;
    let store = Arc::new(TaskStore::load(config.store_path.clone())?);

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp.clone())),
        None => {
            info!("No SMTP relay configured; timeout mail goes to the worker log");
            Arc::new(LogMailer)
        }
    };

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        mailer,
        SchedulerConfig {
            log_path: config.log_path.clone(),
            addr: config.addr.clone(),
            task_chan_size: config.task_chan_size,
            ..SchedulerConfig::default()
        },
    );
    scheduler.restore().await;

    tokio::select! {
        result = server::run_command_server(
            &config.command_bind,
            config.command_port,
            scheduler.clone(),
            Arc::clone(&store),
        ) => {
            if let Err(err) = result {
                error!("Command server terminated: {}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Stopping worker...");
        }
    }

    Ok(())
}
