use crate::cli::args::ValidateArgs;
use crate::exit_codes;
use evalkit_core::config::load_config;
use evalkit_core::conversation::validate_options;
use evalkit_core::input::load_questions;

pub(crate) fn run(args: ValidateArgs) -> anyhow::Result<i32> {
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {}", e);
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

    let mut invalid = 0usize;
    for err in &loaded.rejected {
        eprintln!("invalid: {}", err);
        invalid += 1;
    }
    for item in &loaded.items {
        if let Err(e) = validate_options(item) {
            eprintln!("invalid: {}", e);
            invalid += 1;
        }
    }

    println!(
        "{} question(s) checked, {} invalid; {} model(s), {} persona(s), judge {}",
        loaded.items.len() + loaded.rejected.len(),
        invalid,
        cfg.answer_models().len(),
        cfg.persona_set().names().count(),
        cfg.judge.model
    );
    Ok(if invalid == 0 {
        exit_codes::SUCCESS
    } else {
        exit_codes::TASK_FAILED
    })
}
