//! Two-tier bounded pools: an outer pool over (model, persona) combinations and an inner
//! pool over questions. The split of the worker budget is a pure function, [`fair_share`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// How a worker budget `W` is split across `C` combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairShare {
    /// Inner workers per active combination.
    pub per_combo: usize,
    /// Combinations running at the same time.
    pub active_combos: usize,
    /// `per_combo * active_combos`, never above the budget.
    pub effective_total: usize,
    /// Budget left idle.
    pub unused: usize,
}

/// Splits `workers` across `combos`. A zero budget is clamped to one worker.
pub fn fair_share(workers: usize, combos: usize) -> FairShare {
    let workers = workers.max(1);
    if combos == 0 {
        return FairShare {
            per_combo: workers,
            active_combos: 0,
            effective_total: 0,
            unused: workers,
        };
    }

    let per = (workers / combos).max(1);
    let (per_combo, active_combos) = if per * combos <= workers {
        (per, combos)
    } else {
        let active = (workers / per).max(1);
        ((workers / active).max(1), active)
    };
    let effective_total = per_combo * active_combos;
    FairShare {
        per_combo,
        active_combos,
        effective_total,
        unused: workers.saturating_sub(effective_total),
    }
}

/// Process-wide cooperative stop signal. Checked between dispatches only.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs `task(job)` for each job with at most `limit` in flight.
///
/// Once `stop` is raised no further job is started; jobs already started run to completion.
/// `on_done` sees every finished job in completion order. Returns how many jobs were started.
pub async fn run_bounded<J, T, F, Fut>(
    limit: usize,
    stop: &StopFlag,
    jobs: impl IntoIterator<Item = J>,
    mut task: F,
    mut on_done: impl FnMut(Result<T, JoinError>),
) -> usize
where
    F: FnMut(J) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut join_set = JoinSet::new();
    let mut started = 0;

    for job in jobs {
        if stop.is_stopped() {
            break;
        }
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        if stop.is_stopped() {
            break;
        }
        let fut = task(job);
        join_set.spawn(async move {
            let _permit = permit;
            fut.await
        });
        started += 1;

        while let Some(res) = join_set.try_join_next() {
            on_done(res);
        }
    }

    while let Some(res) = join_set.join_next().await {
        on_done(res);
    }
    started
}
