//! stagegate - verify-and-promote pipeline CLI
//!
//! ## Commands
//!
//! - `snapshot`: record a git recovery point of the current tree
//! - `rollback`: restore the tree to a previous recovery point (destructive)
//! - `verify`: materialize the current tree in isolation and run the suite
//! - `self-update`: run the full backup/stage/verify/gate/package flow
//! - `generate`: drive the producer retry loop for a request
//! - `promote`: move an accepted candidate's code files into the tree

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use stagegate_core::{
    init_tracing, promote_into_tree, BackupRecorder, CandidateChangeSet, GeneratedCandidate,
    GenerationConfig, HttpChatProducer, Layout, Materializer, RetryController, SelfUpdatePipeline,
    SnapshotOutcome, VerificationRunner, VerifyConfig,
};

#[derive(Parser)]
#[command(name = "stagegate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verify-and-promote pipeline for local code mutation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root of the tree being managed
    #[arg(long, global = true, env = "STAGEGATE_ROOT", default_value = ".")]
    root: PathBuf,

    /// Verification suite configuration (JSON); defaults when omitted
    #[arg(long, global = true, env = "STAGEGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a git recovery point of the current tree
    Snapshot {
        /// Commit message
        #[arg(short, long, default_value = "stagegate snapshot")]
        message: String,
    },

    /// Restore the tree to a previous recovery point (destroys uncommitted work)
    Rollback {
        /// Number of snapshots to go back
        #[arg(default_value_t = 1)]
        steps: u32,

        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },

    /// Materialize the current tree in isolation and run the check suite
    Verify,

    /// Run the full self-update flow for a proposed changeset
    SelfUpdate {
        /// JSON file mapping relative paths to full new contents
        #[arg(short, long)]
        changes: PathBuf,
    },

    /// Generate a candidate via the producer retry loop
    Generate {
        /// Free-text request for the producer
        prompt: String,

        /// Files whose contents are sent as context
        #[arg(short = 'f', long = "context-file")]
        context_files: Vec<PathBuf>,

        /// Chat-completions endpoint
        #[arg(
            long,
            env = "STAGEGATE_PRODUCER_URL",
            default_value = "http://localhost:1234/v1/chat/completions"
        )]
        endpoint: String,

        /// Model name passed to the producer
        #[arg(long, env = "STAGEGATE_PRODUCER_MODEL", default_value = "local-model")]
        model: String,

        /// Retries after the initial attempt
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Write the resulting candidate record here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Move an accepted candidate's code files into the tree
    Promote {
        /// Candidate record produced by `generate --output`
        candidate: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let layout = Layout::new(&cli.root);
    let verify_config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str::<VerifyConfig>(&raw).context("parsing verify config")?
        }
        None => VerifyConfig::default(),
    };

    match cli.command {
        Commands::Snapshot { message } => {
            let recorder = BackupRecorder::new(&cli.root);
            match recorder.snapshot(&message)? {
                SnapshotOutcome::Created { handle } => {
                    println!("snapshot created: {handle}");
                }
                SnapshotOutcome::NoChanges => println!("no changes to back up"),
            }
        }

        Commands::Rollback { steps, yes } => {
            if !yes {
                bail!("rollback is destructive to uncommitted work; re-run with --yes");
            }
            let recorder = BackupRecorder::new(&cli.root);
            println!("{}", recorder.recent_history()?);
            recorder.rollback(steps)?;
            println!("rolled back {steps} snapshot(s)");
        }

        Commands::Verify => {
            layout.ensure()?;
            let materializer = Materializer::new(
                layout.staging_dir(),
                stagegate_core::ExcludeRules::defaults()?,
            );
            let workspace =
                materializer.materialize_full(&cli.root, &CandidateChangeSet::new())?;
            let suite = stagegate_core::self_update_suite(&verify_config);
            let report = VerificationRunner::verify(&workspace.root, &suite).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_passed {
                std::process::exit(1);
            }
        }

        Commands::SelfUpdate { changes } => {
            let raw = std::fs::read_to_string(&changes)
                .with_context(|| format!("reading changeset file {}", changes.display()))?;
            let files: BTreeMap<String, String> =
                serde_json::from_str(&raw).context("changeset file must map paths to contents")?;
            let changeset = CandidateChangeSet::from_map(files)?;

            let pipeline = SelfUpdatePipeline::new(layout, verify_config);
            let outcome = pipeline.run(&changeset).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_ready() {
                std::process::exit(1);
            }
        }

        Commands::Generate {
            prompt,
            context_files,
            endpoint,
            model,
            max_retries,
            output,
        } => {
            layout.ensure()?;
            let mut context = BTreeMap::new();
            for path in &context_files {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading context file {}", path.display()))?;
                context.insert(path.to_string_lossy().to_string(), content);
            }

            let producer = HttpChatProducer::new(endpoint, model);
            let materializer = Materializer::new(
                layout.sandbox_dir(),
                stagegate_core::ExcludeRules::defaults()?,
            );
            let config = GenerationConfig {
                max_retries,
                ..GenerationConfig::default()
            };
            let controller = RetryController::new(&producer, &materializer, config);
            let candidate = controller.generate(&prompt, &context).await?;

            println!("{}", candidate.message);
            let rendered = serde_json::to_string_pretty(&candidate)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)?;
                    println!("candidate record written to {}", path.display());
                }
                None => println!("{rendered}"),
            }
            if !candidate.ready_for_implementation {
                std::process::exit(1);
            }
        }

        Commands::Promote { candidate } => {
            let raw = std::fs::read_to_string(&candidate)
                .with_context(|| format!("reading candidate record {}", candidate.display()))?;
            let record: GeneratedCandidate = serde_json::from_str(&raw)?;

            let workspace = record
                .workspace
                .as_ref()
                .context("candidate record has no workspace")?;
            let report = record
                .report
                .as_ref()
                .context("candidate record has no verification report")?;

            let promoted = promote_into_tree(
                &workspace.root,
                &record.changeset,
                report,
                &layout.generated_dir(),
            )?;
            for path in &promoted {
                println!("promoted {}", path.display());
            }
            println!("{} file(s) promoted", promoted.len());
        }
    }

    Ok(())
}
