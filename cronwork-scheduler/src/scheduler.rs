use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use cronwork_cron::CronExpr;
use cronwork_exec::{run_script, ExecError};
use cronwork_mailer::Mailer;
use cronwork_models::{TaskArgs, TaskState};
use cronwork_store::TaskStore;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::driver::TaskDriver;
use crate::handles::{Handle, HandleTable};
use crate::ScheduleError;

/// Default deadline for quick-start runs when the task has no timeout.
const QUICK_START_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory for per-task log files.
    pub log_path: PathBuf,
    /// This worker's identity string, used in mail subject lines.
    pub addr: String,
    /// Bound on pending commands of each kind.
    pub task_chan_size: usize,
    /// Clock cadence. The worker always runs the 60 s default; tests
    /// drive drivers at sub-second cadence through this knob.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("."),
            addr: "cronwork".to_string(),
            task_chan_size: 64,
            tick_interval: Duration::from_secs(60),
        }
    }
}

pub(crate) struct SchedulerInner {
    pub(crate) store: Arc<TaskStore>,
    pub(crate) mailer: Arc<dyn Mailer>,
    pub(crate) config: SchedulerConfig,
    pub(crate) handles: HandleTable,
    add_tx: mpsc::Sender<(TaskArgs, CronExpr)>,
    remove_tx: mpsc::Sender<String>,
    kill_tx: mpsc::Sender<String>,
}

impl SchedulerInner {
    pub(crate) fn sync_store(&self, context: &str) {
        if let Err(err) = self.store.sync() {
            error!("Store sync failed ({context}): {err}");
        }
    }
}

/// The worker-side scheduler engine. Owns the handle table, the global
/// clock, and one serializer per command kind; everything it needs is
/// passed in at construction. Cheap to clone.
///
/// Must be created inside a tokio runtime: construction spawns the
/// clock broadcaster and the command serializers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, mailer: Arc<dyn Mailer>, config: SchedulerConfig) -> Self {
        let chan_size = config.task_chan_size.max(1);
        let (add_tx, add_rx) = mpsc::channel(chan_size);
        let (remove_tx, remove_rx) = mpsc::channel(chan_size);
        let (kill_tx, kill_rx) = mpsc::channel(chan_size);

        let inner = Arc::new(SchedulerInner {
            store,
            mailer,
            config,
            handles: HandleTable::new(),
            add_tx,
            remove_tx,
            kill_tx,
        });

        tokio::spawn(run_clock(inner.clone()));
        tokio::spawn(run_add_loop(inner.clone(), add_rx));
        tokio::spawn(run_remove_loop(inner.clone(), remove_rx));
        tokio::spawn(run_kill_loop(inner.clone(), kill_rx));

        Self { inner }
    }

    /// Re-add every stored task whose last persisted state is active.
    /// Called once at worker startup.
    pub async fn restore(&self) {
        for task in self.inner.store.all() {
            if task.state == TaskState::Inactive {
                continue;
            }
            info!("Restoring task '{}' ({})", task.name, task.id);
            if let Err(err) = self.add(task.clone()).await {
                error!("Failed to restore task {}: {}", task.id, err);
            }
        }
    }

    /// Validate and enqueue a task. A malformed cron expression is the
    /// one error surfaced to the caller; the task is then not installed.
    pub async fn add(&self, task: TaskArgs) -> Result<(), ScheduleError> {
        info!("add task '{}' ({}) cron '{}'", task.name, task.id, task.cron_expr);
        let cron = CronExpr::parse(&task.cron_expr)?;
        self.inner
            .add_tx
            .send((task, cron))
            .await
            .map_err(|_| ScheduleError::QueueClosed)
    }

    /// Kill all running instances, then tear the task down.
    pub async fn stop(&self, task: &TaskArgs) -> Result<(), ScheduleError> {
        info!("stop task '{}' ({})", task.name, task.id);
        self.send_kill(&task.id).await?;
        self.send_remove(&task.id).await
    }

    /// Kill all running instances but leave the driver alive; the next
    /// matching tick may start instances again.
    pub async fn kill(&self, task: &TaskArgs) -> Result<(), ScheduleError> {
        info!("kill task '{}' ({})", task.name, task.id);
        self.send_kill(&task.id).await
    }

    /// Stop the task and drop its record from the store.
    pub async fn delete(&self, task: &TaskArgs) -> Result<(), ScheduleError> {
        info!("delete task '{}' ({})", task.name, task.id);
        self.inner.store.update(|tasks| {
            tasks.remove(&task.id);
        });
        self.inner.sync_store("delete");
        self.send_kill(&task.id).await?;
        self.send_remove(&task.id).await
    }

    /// Run one instance immediately, bypassing the schedule. No Handle
    /// is created. Returns the captured output; failures are appended to
    /// it rather than surfaced, so the caller always gets the log tail.
    pub async fn quick_start(&self, task: &TaskArgs) -> Vec<u8> {
        info!("quick start task '{}' ({})", task.name, task.id);
        let started_at = Local::now();
        let started = Instant::now();

        let timeout = if task.timeout <= 0 {
            QUICK_START_TIMEOUT_SECS
        } else {
            task.timeout
        };
        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout as u64)).await;
                cancel.cancel();
            })
        };

        let mut output = Vec::new();
        let log_path = self.inner.config.log_path.join(task.log_file_name());
        let result = run_script(
            &cancel,
            &log_path,
            &task.command,
            &task.split_args(),
            &mut output,
        )
        .await;
        deadline.abort();

        let cost = started.elapsed().as_millis() as i64;
        match &result {
            Ok(_) | Err(ExecError::Spawn { .. }) => {}
            Err(err) => output.extend_from_slice(format!("{err}\n").as_bytes()),
        }

        self.inner.store.update(|tasks| {
            let record = tasks.entry(task.id.clone()).or_insert_with(|| task.clone());
            record.last_exec_time = started_at.timestamp();
            record.last_cost_time = cost;
        });
        self.inner.sync_store("quick-start");

        info!(
            "quick start '{}' finished, cost {:.3}s ({:?})",
            task.name,
            cost as f64 / 1000.0,
            result.err()
        );
        output
    }

    /// Ids of every task currently holding a Handle.
    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.handles.active_ids().await
    }

    /// Running-instance count for one active task; None when inactive.
    pub async fn instance_count(&self, id: &str) -> Option<usize> {
        self.inner.handles.instance_count(id).await
    }

    async fn send_kill(&self, id: &str) -> Result<(), ScheduleError> {
        self.inner
            .kill_tx
            .send(id.to_string())
            .await
            .map_err(|_| ScheduleError::QueueClosed)
    }

    async fn send_remove(&self, id: &str) -> Result<(), ScheduleError> {
        self.inner
            .remove_tx
            .send(id.to_string())
            .await
            .map_err(|_| ScheduleError::QueueClosed)
    }
}

/// Global clock: one instant every tick interval, fanned out to every
/// active task under the handle-table lock.
async fn run_clock(inner: Arc<SchedulerInner>) {
    let mut interval = tokio::time::interval(inner.config.tick_interval);
    // interval yields immediately on the first call; consume that so the
    // first broadcast lands one full period after construction.
    interval.tick().await;
    loop {
        interval.tick().await;
        inner.handles.broadcast(Local::now()).await;
    }
}

/// Serializer for `add`: installs the Handle, persists Idle, launches
/// the task driver.
async fn run_add_loop(
    inner: Arc<SchedulerInner>,
    mut rx: mpsc::Receiver<(TaskArgs, CronExpr)>,
) {
    while let Some((mut task, cron)) = rx.recv().await {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let control = CancellationToken::new();
        if !inner
            .handles
            .insert(&task.id, Handle::new(control.clone(), tick_tx))
            .await
        {
            warn!("Task {} is already active; add ignored", task.id);
            continue;
        }

        task.state = TaskState::Idle;
        task.number_process = 0;
        // A negative timeout from the wire or a hand-edited store file
        // would wrap to an enormous u64 deadline; treat it as "none".
        task.timeout = task.timeout.max(0);
        inner.store.update(|tasks| {
            tasks.insert(task.id.clone(), task.clone());
        });
        inner.sync_store("add");

        let driver = TaskDriver::new(inner.clone(), task, cron, control, tick_rx);
        tokio::spawn(driver.run());
    }
}

/// Serializer for `stop`/`delete` teardown: fires the control token and
/// lets the driver drain. A task with no Handle just has its persisted
/// state corrected.
async fn run_remove_loop(inner: Arc<SchedulerInner>, mut rx: mpsc::Receiver<String>) {
    while let Some(id) = rx.recv().await {
        if !inner.handles.cancel_control(&id).await {
            if inner.store.update_task(&id, |task| {
                task.state = TaskState::Inactive;
                task.number_process = 0;
            }) {
                inner.sync_store("remove-inactive");
            }
        }
    }
}

/// Serializer for `kill`: fires every instance token of the task.
async fn run_kill_loop(inner: Arc<SchedulerInner>, mut rx: mpsc::Receiver<String>) {
    while let Some(id) = rx.recv().await {
        let killed = inner.handles.kill_instances(&id).await;
        info!("Killed {killed} running instance(s) of task {id}");
    }
}
