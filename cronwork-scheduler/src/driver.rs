use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cronwork_cron::CronExpr;
use cronwork_exec::run_script;
use cronwork_mailer::{timeout_body, timeout_subject};
use cronwork_models::{TaskArgs, TaskState, TimeoutAction};
use log::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::SchedulerInner;

/// One long-lived activity per active task: consumes clock ticks,
/// admits instances against the concurrency bound, and tears the task
/// down when its control token fires.
pub(crate) struct TaskDriver {
    core: Arc<SchedulerInner>,
    task: TaskArgs,
    cron: CronExpr,
    control: CancellationToken,
    tick_rx: mpsc::Receiver<DateTime<Local>>,
}

impl TaskDriver {
    pub(crate) fn new(
        core: Arc<SchedulerInner>,
        task: TaskArgs,
        cron: CronExpr,
        control: CancellationToken,
        tick_rx: mpsc::Receiver<DateTime<Local>>,
    ) -> Self {
        Self {
            core,
            task,
            cron,
            control,
            tick_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Task driver started for '{}' ({})", self.task.name, self.task.id);
        let mut instances: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.control.cancelled() => {
                    // Refuse further ticks first so the broadcaster is
                    // never left blocking on a driver that is draining.
                    self.tick_rx.close();
                    while instances.join_next().await.is_some() {}
                    self.core.handles.remove(&self.task.id).await;
                    self.core.store.update_task(&self.task.id, |task| {
                        task.state = TaskState::Inactive;
                        task.number_process = 0;
                    });
                    self.core.sync_store("driver-exit");
                    info!("Task driver stopped for '{}' ({})", self.task.name, self.task.id);
                    return;
                }
                tick = self.tick_rx.recv() => {
                    let Some(now) = tick else { return };
                    while instances.try_join_next().is_some() {}
                    if !self.cron.matches(&now) {
                        continue;
                    }
                    self.admit_instance(&mut instances, now).await;
                }
            }
        }
    }

    /// Admission: register the instance token under the exclusive table
    /// lock (evicting the oldest at capacity), then persist the Running
    /// transition. The instance itself runs concurrently with the next
    /// tick.
    async fn admit_instance(&self, instances: &mut JoinSet<()>, now: DateTime<Local>) {
        let instance_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let admitted = self
            .core
            .handles
            .admit(&self.task.id, instance_id, cancel.clone(), self.task.max_concurrent)
            .await;
        if !admitted {
            return;
        }

        self.core.store.update_task(&self.task.id, |task| {
            task.state = TaskState::Running;
            task.number_process += 1;
            task.last_exec_time = now.timestamp();
        });
        self.core.sync_store("instance-start");

        instances.spawn(run_instance(
            self.core.clone(),
            self.task.clone(),
            instance_id,
            cancel,
            now,
        ));
    }
}

/// One instance: schedule the timeout watcher, run the child, then do
/// the completion bookkeeping. The runner is awaited through its own
/// spawned task, so a panic is absorbed here and the counters still
/// balance.
async fn run_instance(
    core: Arc<SchedulerInner>,
    task: TaskArgs,
    instance_id: Uuid,
    cancel: CancellationToken,
    started_at: DateTime<Local>,
) {
    let started = Instant::now();
    let finished = Arc::new(AtomicBool::new(false));

    if task.timeout > 0 {
        tokio::spawn(watch_timeout(
            core.clone(),
            task.clone(),
            cancel.clone(),
            finished.clone(),
            started_at,
        ));
    }

    let exec = {
        let core = core.clone();
        let task = task.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut output = Vec::new();
            let log_path = core.config.log_path.join(task.log_file_name());
            run_script(
                &cancel,
                &log_path,
                &task.command,
                &task.split_args(),
                &mut output,
            )
            .await
        })
    };
    let outcome = exec.await;
    finished.store(true, Ordering::SeqCst);

    let cost = started.elapsed().as_millis() as i64;
    core.handles.pop_instance(&task.id, instance_id).await;
    core.store.update_task(&task.id, |record| {
        record.number_process -= 1;
        record.state = if record.number_process <= 0 {
            TaskState::Idle
        } else {
            TaskState::Running
        };
        record.last_cost_time = cost;
    });
    core.sync_store("instance-exit");

    match outcome {
        Ok(result) => info!(
            "{}: {} {} {:?} {:.3}s {:?}",
            task.name,
            task.command,
            task.args,
            task.op_timeout,
            cost as f64 / 1000.0,
            result.err()
        ),
        Err(join_err) => error!(
            "Instance of '{}' ({}) panicked: {}",
            task.name, task.id, join_err
        ),
    }
}

/// Delayed timeout action, guarded by the instance's completion flag so
/// it never fires after a natural exit.
async fn watch_timeout(
    core: Arc<SchedulerInner>,
    task: TaskArgs,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    started_at: DateTime<Local>,
) {
    tokio::time::sleep(Duration::from_secs(task.timeout.max(0) as u64)).await;
    if finished.load(Ordering::SeqCst) {
        return;
    }

    match task.op_timeout {
        TimeoutAction::Ignore => {}
        TimeoutAction::Kill => cancel.cancel(),
        TimeoutAction::Email => send_timeout_mail(&core, &task, started_at).await,
        TimeoutAction::EmailAndKill => {
            cancel.cancel();
            send_timeout_mail(&core, &task, started_at).await;
        }
    }
}

async fn send_timeout_mail(core: &SchedulerInner, task: &TaskArgs, started_at: DateTime<Local>) {
    let subject = timeout_subject(&core.config.addr);
    let body = timeout_body(&task.name, &task.command, &task.args, started_at, task.timeout);
    if let Err(err) = core.mailer.send_mail(&task.mail_to, &subject, &body).await {
        error!("Failed to send timeout mail for '{}': {}", task.name, err);
    }
}
