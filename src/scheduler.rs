use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Utc};
use error_stack::{Report, ResultExt};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ScheduleConfig;
use crate::engine::outcome::AggregatedOutcome;
use crate::engine::plan::{CalculationPlan, PriorityFilter};
use crate::engine::{EngineSettings, Orchestrator};
use crate::error::{EngineError, SchedulerError};
use crate::model::{ChipRecord, Family, PriceBar, PriorityTier};
use crate::registry::Registries;
use crate::storage::{ResultSink, RunLog, SeriesSource, StockUniverse};

/// One orchestrator per family, sharing a store.
pub struct Engines {
    pub technical: Arc<Orchestrator<PriceBar>>,
    pub chip: Arc<Orchestrator<ChipRecord>>,
    pub pattern: Arc<Orchestrator<PriceBar>>,
}

impl Engines {
    pub fn build<S>(registries: &Registries, store: Arc<S>, settings: &EngineSettings) -> Self
    where
        S: StockUniverse
            + SeriesSource<PriceBar>
            + SeriesSource<ChipRecord>
            + ResultSink
            + RunLog
            + 'static,
    {
        Self {
            technical: Arc::new(
                Orchestrator::new(
                    Arc::clone(&registries.technical),
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    settings.clone(),
                )
                .with_run_log(store.clone()),
            ),
            chip: Arc::new(
                Orchestrator::new(
                    Arc::clone(&registries.chip),
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    settings.clone(),
                )
                .with_run_log(store.clone()),
            ),
            pattern: Arc::new(
                Orchestrator::new(
                    Arc::clone(&registries.pattern),
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    settings.clone(),
                )
                .with_run_log(store),
            ),
        }
    }

    pub async fn run(
        &self,
        family: Family,
        plan: &CalculationPlan,
        cancel: &CancellationToken,
    ) -> Result<AggregatedOutcome, Report<EngineError>> {
        match family {
            Family::Technical => self.technical.run(plan, cancel).await,
            Family::Chip => self.chip.run(plan, cancel).await,
            Family::Pattern => self.pattern.run(plan, cancel).await,
        }
    }
}

pub type FamilyOutcome = (Family, Result<AggregatedOutcome, Report<EngineError>>);

/// Parameters of an operator-requested run.
#[derive(Debug, Clone)]
pub struct ManualRun {
    pub date: NaiveDate,
    /// `None` runs every tier.
    pub tier: Option<PriorityTier>,
    pub at_or_above: bool,
    pub families: Vec<Family>,
    pub force: bool,
    pub stock_ids: Vec<String>,
    pub calculators: Vec<String>,
}

impl ManualRun {
    pub fn plan(&self) -> CalculationPlan {
        let priority = match (self.tier, self.at_or_above) {
            (None, _) => PriorityFilter::All,
            (Some(tier), true) => PriorityFilter::AtOrAbove(tier),
            (Some(tier), false) => PriorityFilter::Exactly(tier),
        };
        let mut plan = CalculationPlan::for_date(self.date)
            .with_priority(priority)
            .forced(self.force);
        if !self.stock_ids.is_empty() {
            plan = plan.with_stocks(self.stock_ids.iter().cloned());
        }
        if !self.calculators.is_empty() {
            plan = plan.only_calculators(self.calculators.iter().cloned());
        }
        plan
    }
}

/// Entry points used by cron jobs and the CLI.
#[derive(Clone)]
pub struct Triggers {
    engines: Arc<Engines>,
    offset: FixedOffset,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Triggers {
    pub fn new(
        engines: Arc<Engines>,
        utc_offset_hours: i32,
        cancel: CancellationToken,
    ) -> Result<Self, Report<SchedulerError>> {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).ok_or_else(|| {
            Report::new(SchedulerError::Init)
                .attach(format!("invalid utc offset: {utc_offset_hours}h"))
        })?;
        Ok(Self {
            engines,
            offset,
            cancel,
            tracker: TaskTracker::new(),
        })
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    /// Tracks scheduled runs still in flight.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// The calendar date at the configured offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// Today's run of exactly `tier` for each family, without forcing.
    pub async fn run_daily(&self, tier: PriorityTier, families: &[Family]) -> Vec<FamilyOutcome> {
        let plan = CalculationPlan::for_date(self.today())
            .with_priority(PriorityFilter::Exactly(tier));
        self.run_families(&plan, families).await
    }

    pub async fn run_manually(&self, request: &ManualRun) -> Vec<FamilyOutcome> {
        self.run_families(&request.plan(), &request.families).await
    }

    async fn run_families(
        &self,
        plan: &CalculationPlan,
        families: &[Family],
    ) -> Vec<FamilyOutcome> {
        let unique: BTreeSet<Family> = families.iter().copied().collect();
        let mut outcomes = Vec::with_capacity(unique.len());
        for family in unique {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = self.engines.run(family, plan, &self.cancel).await;
            if let Err(e) = &result {
                warn!(error = ?e, %family, date = %plan.date, "calculation run failed");
            }
            outcomes.push((family, result));
        }
        outcomes
    }
}

/// Register one cron job per schedule entry and start the scheduler.
pub async fn start(
    triggers: Triggers,
    schedules: &[ScheduleConfig],
) -> Result<JobScheduler, Report<SchedulerError>> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| Report::new(SchedulerError::Init).attach(format!("{e:?}")))?;

    for schedule in schedules {
        let tier = schedule.priority().change_context(SchedulerError::Init)?;
        let families = schedule
            .parsed_families()
            .change_context(SchedulerError::Init)?;
        let triggers = triggers.clone();

        let job = Job::new_async(schedule.cron.as_str(), move |_uuid, _l| {
            let triggers = triggers.clone();
            let families = families.clone();
            let tracker = triggers.tracker().clone();
            Box::pin(tracker.track_future(async move {
                info!(%tier, ?families, "scheduled run triggered");
                for (family, result) in triggers.run_daily(tier, &families).await {
                    if let Ok(outcome) = result {
                        info!(%tier, %family, summary = %outcome.summary, "scheduled run complete");
                    }
                }
            }))
        })
        .map_err(|e| {
            Report::new(SchedulerError::InvalidCron {
                cron: schedule.cron.clone(),
            })
            .attach(format!("{e:?}"))
        })?;

        sched
            .add(job)
            .await
            .map_err(|e| Report::new(SchedulerError::Init).attach(format!("{e:?}")))?;
        info!(tier = %schedule.tier, cron = %schedule.cron, "schedule registered");
    }

    sched
        .start()
        .await
        .map_err(|e| Report::new(SchedulerError::Start).attach(format!("{e:?}")))?;
    Ok(sched)
}
