use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use chrono::Local;
use log::error;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("script killed before exit")]
    Cancelled,
    #[error("failed waiting for child: {0}")]
    Wait(#[source] io::Error),
}

/// Run one command instance. A timestamped header followed by the child's
/// merged stdout and stderr is appended to the log file at `log_path`;
/// the child output is additionally accumulated into `output`.
///
/// The child runs in its own process group. When `cancel` fires before
/// the child exits, the whole group is killed and `ExecError::Cancelled`
/// is returned. Spawn failures append their text to both sinks verbatim.
/// Log-file IO problems never fail the run; they are logged and the file
/// is abandoned for the remainder of the instance.
pub async fn run_script(
    cancel: &CancellationToken,
    log_path: &Path,
    command: &str,
    args: &[String],
    output: &mut Vec<u8>,
) -> Result<ExitStatus, ExecError> {
    let mut log_file = open_log(log_path).await;

    let header = format!(
        "\n[{}] {} {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        command,
        args.join(" ")
    );
    append(&mut log_file, log_path, header.as_bytes()).await;

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let text = format!("failed to spawn {command}: {source}\n");
            append(&mut log_file, log_path, text.as_bytes()).await;
            output.extend_from_slice(text.as_bytes());
            return Err(ExecError::Spawn {
                command: command.to_string(),
                source,
            });
        }
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    append(&mut log_file, log_path, &chunk).await;
                    output.extend_from_slice(&chunk);
                }
                // Both pump tasks are done, so the child has closed its
                // output and wait() will not block on pipe draining.
                None => return child.wait().await.map_err(ExecError::Wait),
            },
            _ = cancel.cancelled() => {
                kill_group(&mut child).await;
                while let Some(chunk) = rx.recv().await {
                    append(&mut log_file, log_path, &chunk).await;
                    output.extend_from_slice(&chunk);
                }
                let _ = child.wait().await;
                let tail = format!(
                    "[{}] killed before exit\n",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                );
                append(&mut log_file, log_path, tail.as_bytes()).await;
                return Err(ExecError::Cancelled);
            }
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn open_log(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(err) => {
            error!("Failed to open task log {}: {}", path.display(), err);
            None
        }
    }
}

async fn append(file: &mut Option<File>, path: &Path, data: &[u8]) {
    if let Some(inner) = file {
        if let Err(err) = inner.write_all(data).await {
            error!("Failed to write task log {}: {}", path.display(), err);
            *file = None;
        }
    }
}

/// Kill the child's whole process group so shell descendants die with it.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
        return;
    }

    if let Err(err) = child.kill().await {
        error!("Failed to kill child process: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn temp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cronwork-exec-{name}-{}.log", std::process::id()))
    }

    #[tokio::test]
    async fn captures_output_in_buffer_and_log() {
        let log = temp_log("echo");
        let cancel = CancellationToken::new();
        let mut output = Vec::new();

        let status = run_script(&cancel, &log, "/bin/echo", &["hello".into()], &mut output)
            .await
            .expect("echo runs");

        assert!(status.success());
        assert_eq!(String::from_utf8_lossy(&output).trim(), "hello");

        let logged = std::fs::read_to_string(&log).expect("log file written");
        assert!(logged.contains("/bin/echo hello"));
        assert!(logged.contains("hello\n"));

        std::fs::remove_file(&log).ok();
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let log = temp_log("cancel");
        let cancel = CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel();
        });

        let started = Instant::now();
        let mut output = Vec::new();
        let result = run_script(&cancel, &log, "/bin/sleep", &["30".into()], &mut output).await;

        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));

        std::fs::remove_file(&log).ok();
    }

    #[tokio::test]
    async fn spawn_failure_is_appended_verbatim() {
        let log = temp_log("spawn");
        let cancel = CancellationToken::new();
        let mut output = Vec::new();

        let result = run_script(&cancel, &log, "/no/such/binary", &[], &mut output).await;

        assert!(matches!(result, Err(ExecError::Spawn { .. })));
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("failed to spawn /no/such/binary"));

        std::fs::remove_file(&log).ok();
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let log = temp_log("exit");
        let cancel = CancellationToken::new();
        let mut output = Vec::new();

        let status = run_script(
            &cancel,
            &log,
            "/bin/sh",
            &["-c".into(), "exit 3".into()],
            &mut output,
        )
        .await
        .expect("shell runs");

        assert_eq!(status.code(), Some(3));

        std::fs::remove_file(&log).ok();
    }
}
