use crate::cli::args::StatsArgs;
use crate::exit_codes;
use anyhow::Context;
use evalkit_core::report::console::format_accuracy_line;
use evalkit_core::stats;
use evalkit_core::store::{load_artifact, rewrite_header};

/// Prints the statistics of all given artifacts combined as JSON on stdout.
///
/// Per-artifact accuracy goes to stderr. With `--write`, each header is rewritten first.
pub(crate) async fn run(args: StatsArgs) -> anyhow::Result<i32> {
    let mut records = Vec::new();
    for path in &args.artifacts {
        if args.write {
            rewrite_header(path, args.scoring)
                .await
                .with_context(|| format!("failed to rewrite {}", path.display()))?;
        }
        let artifact = load_artifact(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if artifact.skipped > 0 {
            eprintln!(
                "{}: {} entries are not result records and were ignored",
                path.display(),
                artifact.skipped
            );
        }
        let own = stats::compute(&artifact.records, args.scoring);
        eprintln!("{}", format_accuracy_line(path, &own.total));
        records.extend(artifact.records);
    }

    let combined = stats::compute(&records, args.scoring);
    println!("{}", serde_json::to_string_pretty(&combined)?);
    Ok(exit_codes::SUCCESS)
}
