use super::executor::TaskExecutor;
use super::scheduler::{fair_share, run_bounded, FairShare, StopFlag};
use crate::errors::TaskFailure;
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::model::{Combo, QuestionItem};
use crate::report::progress::{ProgressEvent, ProgressSink};
use crate::report::summary::FailureSummary;
use crate::stats::Statistics;
use crate::store::codec::OutputFormat;
use crate::store::layout::{artifact_dir, generated_file_name, next_free_version};
use crate::store::{ArtifactStore, StoreOptions};
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Total worker budget across every combination.
    pub workers: usize,
    pub store: StoreOptions,
    pub output_dir: PathBuf,
    /// Explicit artifact file name; generated when absent.
    pub output_file: Option<String>,
    /// Skip ids that already have an authoritative record. Needs `output_file`.
    pub resume: bool,
    /// Question file, used to name generated artifacts.
    pub input_path: PathBuf,
    pub limit: Option<usize>,
}

/// Per-artifact result of a run.
#[derive(Debug, Clone)]
pub struct ArtifactReport {
    pub combo: Combo,
    pub path: PathBuf,
    /// Ids skipped because the artifact already answered them.
    pub resumed: usize,
    pub scheduled: usize,
    /// Final header; `None` when the last flush failed.
    pub statistics: Option<Statistics>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Correlates the log lines of one invocation.
    pub run_id: String,
    pub interrupted: bool,
    pub share: FairShare,
    pub failures: FailureSummary,
    pub artifacts: Vec<ArtifactReport>,
    pub persistence_errors: Vec<String>,
    pub metrics: MetricsSnapshot,
}

struct ComboPlan {
    combo: Combo,
    store: Arc<ArtifactStore>,
    pending: Vec<QuestionItem>,
}

pub struct Runner {
    executor: Arc<TaskExecutor>,
    metrics: Arc<RunMetrics>,
    stop: StopFlag,
    progress: Option<ProgressSink>,
}

impl Runner {
    pub fn new(executor: Arc<TaskExecutor>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            executor,
            metrics,
            stop: StopFlag::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_stop(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Evaluates every (question, combination) task not already answered in its artifact.
    ///
    /// Buffered records of every artifact are flushed before returning, also after a stop.
    /// After a stop, artifacts with nothing buffered are left untouched.
    /// Fails before any task starts when two combinations resolve to the same artifact.
    pub async fn run(
        &self,
        items: &[QuestionItem],
        combos: &[Combo],
        options: &RunOptions,
    ) -> anyhow::Result<RunOutcome> {
        if options.resume && options.output_file.is_none() {
            anyhow::bail!("--resume requires an explicit output file name");
        }

        let run_id = format!("run_{}", Uuid::new_v4().simple());
        let share = fair_share(options.workers, combos.len());
        if share.unused > 0 {
            warn!(
                workers = options.workers,
                combos = combos.len(),
                used = share.effective_total,
                unused = share.unused,
                "worker budget does not divide evenly; some workers stay idle"
            );
        }
        info!(
            run_id = %run_id,
            per_combo = share.per_combo,
            active_combos = share.active_combos,
            effective_total = share.effective_total,
            "scheduling"
        );

        let (file_name, format) = self.artifact_name(options);
        let store_options = StoreOptions {
            format,
            ..options.store
        };

        let mut claimed: HashMap<PathBuf, &Combo> = HashMap::new();
        for combo in combos {
            let path = artifact_dir(&options.output_dir, combo).join(&file_name);
            if let Some(other) = claimed.insert(path.clone(), combo) {
                anyhow::bail!(
                    "{}/{} and {}/{} would share the artifact {}",
                    other.persona,
                    other.model,
                    combo.persona,
                    combo.model,
                    path.display()
                );
            }
        }

        let mut plans = Vec::with_capacity(combos.len());
        let mut artifacts = Vec::with_capacity(combos.len());
        for combo in combos {
            let mut path = artifact_dir(&options.output_dir, combo).join(&file_name);
            if !options.resume {
                path = next_free_version(&path);
            } else if !path.exists() {
                warn!(path = %path.display(), "resume target does not exist; starting fresh");
            }

            let store = ArtifactStore::open(&path, store_options)
                .await
                .with_context(|| format!("failed to open artifact {}", path.display()))?;
            let pending: Vec<QuestionItem> = items
                .iter()
                .filter(|q| !store.authoritative_ids().contains(&q.id))
                .cloned()
                .collect();
            let resumed = items.len() - pending.len();
            info!(
                model = %combo.model,
                persona = %combo.persona,
                path = %path.display(),
                scheduled = pending.len(),
                resumed,
                "prepared combination"
            );

            artifacts.push(ArtifactReport {
                combo: combo.clone(),
                path,
                resumed,
                scheduled: pending.len(),
                statistics: None,
            });
            plans.push(ComboPlan {
                combo: combo.clone(),
                store: Arc::new(store),
                pending,
            });
        }
        let stores: Vec<Arc<ArtifactStore>> = plans.iter().map(|p| p.store.clone()).collect();

        let mut failures = FailureSummary::default();
        run_bounded(
            share.active_combos,
            &self.stop,
            plans,
            |plan| {
                let executor = self.executor.clone();
                let stop = self.stop.clone();
                let progress = self.progress.clone();
                run_combo(executor, plan, share.per_combo, stop, progress)
            },
            |res| match res {
                Ok(f) => failures.extend(f),
                Err(e) => failures.push(TaskFailure {
                    question_id: "unknown".into(),
                    model: "unknown".into(),
                    persona: "unknown".into(),
                    reason: format!("combination task panicked: {}", e),
                }),
            },
        )
        .await;

        let interrupted = self.stop.is_stopped();
        if interrupted {
            warn!(run_id = %run_id, "stop requested; flushing buffered results");
        }

        let mut persistence_errors = Vec::new();
        for (report, store) in artifacts.iter_mut().zip(&stores) {
            if interrupted && store.pending().await == 0 {
                report.statistics = Some(store.statistics().await);
                continue;
            }
            match store.finalize().await {
                Ok(stats) => report.statistics = Some(stats),
                Err(e) => {
                    error!(path = %report.path.display(), error = %e, "final flush failed");
                    persistence_errors.push(format!("{}: {}", report.path.display(), e));
                }
            }
        }

        Ok(RunOutcome {
            run_id,
            interrupted,
            share,
            failures,
            artifacts,
            persistence_errors,
            metrics: self.metrics.snapshot(),
        })
    }

    /// The artifact file name shared by every combination, and the encoding it implies.
    fn artifact_name(&self, options: &RunOptions) -> (String, OutputFormat) {
        match &options.output_file {
            Some(name) if Path::new(name).extension().is_some() => {
                (name.clone(), OutputFormat::from_path(Path::new(name)))
            }
            Some(name) => (
                format!("{}.{}", name, options.store.format.extension()),
                options.store.format,
            ),
            None => (
                generated_file_name(
                    &options.input_path,
                    options.limit,
                    options.store.format,
                    &chrono::Local::now(),
                ),
                options.store.format,
            ),
        }
    }
}

async fn run_combo(
    executor: Arc<TaskExecutor>,
    plan: ComboPlan,
    per_combo: usize,
    stop: StopFlag,
    progress: Option<ProgressSink>,
) -> Vec<TaskFailure> {
    let ComboPlan {
        combo,
        store,
        pending,
    } = plan;
    let total = pending.len();
    let done = Arc::new(AtomicUsize::new(0));
    let mut failures = Vec::new();

    run_bounded(
        per_combo,
        &stop,
        pending,
        |item| {
            let executor = executor.clone();
            let store = store.clone();
            let combo = combo.clone();
            let done = done.clone();
            let progress = progress.clone();
            async move {
                let output = executor.execute(&item, &combo).await;
                if let Some(record) = &output.record {
                    if let Err(e) = store.append(record).await {
                        error!(
                            question_id = %item.id,
                            path = %store.path().display(),
                            error = %e,
                            "could not persist batch; records stay buffered"
                        );
                    }
                }
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(sink) = &progress {
                    sink(ProgressEvent {
                        combo: combo.clone(),
                        done: finished,
                        total,
                    });
                }
                output.failures
            }
        },
        |res| match res {
            Ok(f) => failures.extend(f),
            Err(e) => failures.push(TaskFailure {
                question_id: "unknown".into(),
                model: combo.model.clone(),
                persona: combo.persona.clone(),
                reason: format!("task panicked: {}", e),
            }),
        },
    )
    .await;

    info!(model = %combo.model, persona = %combo.persona, failed = failures.len(), "combination finished");
    failures
}
