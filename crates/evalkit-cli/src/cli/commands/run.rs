use crate::cli::args::RunArgs;
use crate::exit_codes;
use anyhow::Context;
use evalkit_core::config::{load_config, EvalConfig, MissingMediaPolicy};
use evalkit_core::input::{load_questions, select, Selection};
use evalkit_core::judge::JudgeService;
use evalkit_core::metrics::RunMetrics;
use evalkit_core::report::console::{default_progress_sink, format_accuracy_line};
use evalkit_core::store::StoreOptions;
use evalkit_core::{Combo, RunOptions, RunOutcome, Runner, StopFlag, TaskExecutor};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let combos = match combinations(&cfg, &args) {
        Ok(combos) => combos,
        Err(msg) => {
            eprintln!("config error: {}", msg);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let loaded = match load_questions(&args.input) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("input error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    for rejected in &loaded.rejected {
        warn!(error = %rejected, "question rejected at load");
    }
    let items = select(
        loaded.items,
        Selection {
            limit: args.limit,
            random: args.random,
            seed: args.seed,
        },
    );
    info!(
        questions = items.len(),
        combinations = combos.len(),
        tasks = items.len() * combos.len(),
        "starting run"
    );

    let models: Vec<String> = {
        let mut ids: Vec<String> = combos.iter().map(|c| c.model.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    };
    let registry = cfg
        .build_registry(&models)
        .context("failed to build model clients")?;
    let judge_client = cfg.judge_client().context("failed to build judge client")?;
    let judge = JudgeService::new(
        Arc::new(judge_client),
        cfg.judge.model.clone(),
        cfg.judge_retry_policy(),
    );

    let missing_media = if args.skip_missing_media {
        MissingMediaPolicy::DropReference
    } else {
        cfg.settings.missing_media
    };
    let metrics = Arc::new(RunMetrics::new());
    let executor = TaskExecutor::new(
        Arc::new(registry),
        judge,
        cfg.persona_set(),
        cfg.retry_policy(),
        metrics.clone(),
    )
    .with_missing_media(missing_media);

    let stop = StopFlag::new();
    let interrupt = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight tasks");
                stop.stop();
            }
        })
    };

    let runner = Runner::new(Arc::new(executor), metrics)
        .with_progress(default_progress_sink())
        .with_stop(stop);
    let options = RunOptions {
        workers: args.workers.unwrap_or(cfg.settings.workers),
        store: StoreOptions {
            format: args.output_format.unwrap_or(cfg.settings.output_format),
            batch_size: args.batch_size.unwrap_or(cfg.settings.batch_size).max(1),
            scoring: args.scoring.unwrap_or(cfg.settings.scoring),
        },
        output_dir: args
            .output_dir
            .clone()
            .unwrap_or_else(|| cfg.settings.output_dir.clone()),
        output_file: args.output_file.clone(),
        resume: args.resume,
        input_path: args.input.clone(),
        limit: args.limit,
    };

    let outcome = runner.run(&items, &combos, &options).await;
    interrupt.abort();
    let outcome = outcome?;

    Ok(report(&outcome, loaded.rejected.len()))
}

/// Every requested (model, persona) pair, in a stable order.
fn combinations(cfg: &EvalConfig, args: &RunArgs) -> Result<Vec<Combo>, String> {
    let models = if args.models.is_empty() {
        cfg.answer_models()
    } else {
        args.models.clone()
    };
    if models.is_empty() {
        return Err("no answer models configured".into());
    }
    if let Some(unknown) = models.iter().find(|m| !cfg.models.contains_key(*m)) {
        return Err(format!("model '{}' is not defined under models", unknown));
    }

    let persona_set = cfg.persona_set();
    let personas: Vec<String> = if args.personas.is_empty() {
        persona_set.names().map(str::to_string).collect()
    } else {
        args.personas.clone()
    };
    if let Some(unknown) = personas.iter().find(|p| !persona_set.contains(p)) {
        return Err(format!("unknown persona '{}'", unknown));
    }

    Ok(models
        .iter()
        .flat_map(|m| personas.iter().map(move |p| Combo::new(m.clone(), p.clone())))
        .collect())
}

fn report(outcome: &RunOutcome, rejected: usize) -> i32 {
    if outcome.interrupted {
        return exit_codes::INTERRUPTED;
    }

    for artifact in &outcome.artifacts {
        if let Some(stats) = &artifact.statistics {
            println!("{}", format_accuracy_line(&artifact.path, &stats.total));
        }
    }
    if !outcome.failures.is_empty() {
        eprint!("{}", outcome.failures.render());
    }
    for err in &outcome.persistence_errors {
        eprintln!("persistence error: {}", err);
    }
    if rejected > 0 {
        eprintln!("{} question(s) rejected at load", rejected);
    }
    info!(
        run_id = %outcome.run_id,
        started = outcome.metrics.tasks_started,
        completed = outcome.metrics.tasks_completed,
        failed = outcome.metrics.tasks_failed,
        inference_calls = outcome.metrics.inference_calls,
        judge_calls = outcome.metrics.judge_calls,
        retries = outcome.metrics.retries,
        "run finished"
    );

    if outcome.failures.is_empty() && outcome.persistence_errors.is_empty() && rejected == 0 {
        exit_codes::SUCCESS
    } else {
        exit_codes::TASK_FAILED
    }
}
