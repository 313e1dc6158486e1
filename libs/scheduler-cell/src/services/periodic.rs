use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use lesson_cell::{PlannerReport, PlannerService};

use crate::models::{JobOutcome, ReminderReport, PLANNER_JOB, REMINDER_JOB};
use crate::services::reminder::ReminderService;
use crate::services::runner::JobRunner;
use crate::SchedulerError;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Call `tick` every `every` until `shutdown` flips to true. The first tick
/// fires immediately. A zero period is raised to one millisecond.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let every = every.max(MIN_PERIOD);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Periodic job {} started (every {:?})", name, every);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Periodic job {} stopped", name);
    })
}

/// The scheduler's recurring work: lesson planning and reminders, each
/// single-flight across processes.
pub struct JobScheduler {
    runner: JobRunner,
    planner: PlannerService,
    reminders: ReminderService,
    planner_every: Duration,
    reminder_every: Duration,
}

impl JobScheduler {
    pub fn new(
        runner: JobRunner,
        planner: PlannerService,
        reminders: ReminderService,
        planner_every: Duration,
        reminder_every: Duration,
    ) -> Self {
        Self {
            runner,
            planner,
            reminders,
            planner_every,
            reminder_every,
        }
    }

    pub async fn run_planner(&self) -> Result<JobOutcome<Vec<PlannerReport>>, SchedulerError> {
        self.runner
            .run_singleton(PLANNER_JOB, || self.planner.generate_for_all_schools())
            .await
    }

    pub async fn run_reminders(&self) -> Result<JobOutcome<ReminderReport>, SchedulerError> {
        self.runner
            .run_singleton(REMINDER_JOB, || self.reminders.send_due_reminders(Utc::now()))
            .await
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let planner = self.clone();
        let planner_handle = spawn_periodic(PLANNER_JOB, self.planner_every, shutdown.clone(), move || {
            let scheduler = planner.clone();
            async move {
                match scheduler.run_planner().await {
                    Ok(JobOutcome::Completed(reports)) => {
                        let generated: usize = reports.iter().map(|r| r.generated).sum();
                        info!("Planner run finished: {} schools, {} lessons", reports.len(), generated);
                    }
                    Ok(JobOutcome::Skipped) => {}
                    Err(e) => error!("Planner run failed: {}", e),
                }
            }
        });

        let reminders = self.clone();
        let reminder_handle = spawn_periodic(REMINDER_JOB, self.reminder_every, shutdown, move || {
            let scheduler = reminders.clone();
            async move {
                if let Err(e) = scheduler.run_reminders().await {
                    error!("Reminder run failed: {}", e);
                }
            }
        });

        vec![planner_handle, reminder_handle]
    }
}
