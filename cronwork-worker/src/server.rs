use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use cronwork_models::errors::{RuntimeError, SendableError};
use cronwork_models::{CommandReply, CommandRequest};
use cronwork_scheduler::Scheduler;
use cronwork_store::TaskStore;

pub async fn run_command_server(
    bind_address: &str,
    port: u16,
    scheduler: Scheduler,
    store: Arc<TaskStore>,
) -> Result<(), SendableError> {
    let listener = TcpListener::bind((bind_address, port)).await?;
    info!("Worker listening for commands on {}:{}", bind_address, port);

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let scheduler = scheduler.clone();
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, scheduler, store, peer_addr).await {
                error!("Error handling command: {}", err);
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    scheduler: Scheduler,
    store: Arc<TaskStore>,
    peer_addr: SocketAddr,
) -> Result<(), SendableError> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();

    let bytes = reader
        .read_line(&mut line)
        .await
        .map_err(|err| -> SendableError { Box::new(err) })?;

    if bytes == 0 {
        return Err(RuntimeError::boxed(
            "worker.connection.empty",
            "no data received from server",
        ));
    }

    let request = CommandRequest::from_json(line.trim())
        .map_err(|err| -> SendableError { Box::new(err) })?;
    info!("Received {} command from {}", command_name(&request), peer_addr);

    let reply = execute(request, &scheduler, &store).await;
    send_response(reader, reply).await
}

async fn execute(request: CommandRequest, scheduler: &Scheduler, store: &TaskStore) -> CommandReply {
    match request {
        CommandRequest::Add { task } => match scheduler.add(task).await {
            Ok(()) => CommandReply::success(),
            Err(err) => CommandReply::failure(err.to_string()),
        },
        CommandRequest::Stop { task } => match scheduler.stop(&task).await {
            Ok(()) => CommandReply::success(),
            Err(err) => CommandReply::failure(err.to_string()),
        },
        CommandRequest::Kill { task } => match scheduler.kill(&task).await {
            Ok(()) => CommandReply::success(),
            Err(err) => CommandReply::failure(err.to_string()),
        },
        CommandRequest::Delete { task } => match scheduler.delete(&task).await {
            Ok(()) => CommandReply::success(),
            Err(err) => CommandReply::failure(err.to_string()),
        },
        CommandRequest::QuickStart { task } => {
            let output = scheduler.quick_start(&task).await;
            CommandReply::with_output(String::from_utf8_lossy(&output).into_owned())
        }
        CommandRequest::List => CommandReply::with_tasks(store.all()),
    }
}

async fn send_response(
    reader: BufReader<TcpStream>,
    reply: CommandReply,
) -> Result<(), SendableError> {
    let mut socket = reader.into_inner();
    let payload = reply
        .to_json()
        .map_err(|err| -> SendableError { Box::new(err) })?;
    socket
        .write_all(payload.as_bytes())
        .await
        .map_err(|err| -> SendableError { Box::new(err) })?;
    socket
        .write_all(b"\n")
        .await
        .map_err(|err| -> SendableError { Box::new(err) })?;
    socket
        .flush()
        .await
        .map_err(|err| -> SendableError { Box::new(err) })?;
    Ok(())
}

fn command_name(request: &CommandRequest) -> &'static str {
    match request {
        CommandRequest::Add { .. } => "add",
        CommandRequest::Stop { .. } => "stop",
        CommandRequest::Kill { .. } => "kill",
        CommandRequest::Delete { .. } => "delete",
        CommandRequest::QuickStart { .. } => "quick_start",
        CommandRequest::List => "list",
    }
}
