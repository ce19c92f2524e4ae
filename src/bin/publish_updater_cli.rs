//! Publish Updater CLI - Bridge interface for the host application
//!
//! Commands: templates, command, latest, rewrite, update
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 when any record was skipped or failed

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use publish_updater::{
    publish::{JsonCatalog, LedgerRegistrar, PublishId},
    UpdatePipeline, UpdaterConfig,
};

#[derive(Parser)]
#[command(name = "publish-updater-cli")]
#[command(about = "Publish Updater CLI - refresh references and republish scene files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured templates
    Templates,

    /// Print the update command descriptor
    Command,

    /// Resolve the template and latest version of a path
    Latest {
        #[arg(short, long)]
        path: String,
    },

    /// Rewrite stale references in one file
    Rewrite {
        /// JSON array of publish records
        #[arg(long)]
        catalog: PathBuf,

        #[arg(short, long)]
        input: PathBuf,

        /// Written to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Update the given publish records
    Update {
        /// JSON array of publish records
        #[arg(long)]
        catalog: PathBuf,

        /// JSON-lines file registrations are appended to
        #[arg(long)]
        ledger: PathBuf,

        #[arg(required = true)]
        ids: Vec<PublishId>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "publish_updater=debug"
    } else {
        "publish_updater=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!(r#"{{"error": "Failed to serialize output: {}"}}"#, e),
    }
}

fn fail(message: String) -> ExitCode {
    print_json(&serde_json::json!({ "success": false, "error": message }));
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match UpdaterConfig::load_or_default_location(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => return fail(e.to_string()),
    };

    if let Commands::Command = cli.command {
        print_json(&config.command());
        return ExitCode::SUCCESS;
    }

    let pipeline = match UpdatePipeline::from_config(&config) {
        Ok(p) => p,
        Err(e) => return fail(e.to_string()),
    };

    match cli.command {
        Commands::Command => ExitCode::SUCCESS,

        Commands::Templates => {
            let registry = pipeline.registry();
            let templates: Vec<_> = registry
                .list()
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name(),
                        "definition": t.definition(),
                        "keys": t.keys().collect::<Vec<_>>(),
                    })
                })
                .collect();
            print_json(&serde_json::json!({
                "root": registry.root(),
                "templates": templates,
            }));
            ExitCode::SUCCESS
        }

        Commands::Latest { path } => match pipeline.inspect_path(&path) {
            Ok(inspection) => {
                print_json(&inspection);
                ExitCode::SUCCESS
            }
            Err(e) => fail(e.to_string()),
        },

        Commands::Rewrite {
            catalog,
            input,
            output,
        } => {
            let catalog = match JsonCatalog::load(&catalog) {
                Ok(c) => c,
                Err(e) => return fail(e.to_string()),
            };
            let rewriter = pipeline.rewriter(&catalog);

            let result = match output {
                Some(output) => rewriter.rewrite_file(&input, &output).map(|report| {
                    print_json(&report);
                    report
                }),
                None => {
                    let reader = match File::open(&input) {
                        Ok(f) => BufReader::new(f),
                        Err(e) => return fail(format!("Failed to open {}: {}", input.display(), e)),
                    };
                    rewriter
                        .rewrite(reader, BufWriter::new(io::stdout().lock()))
                        .map(|report| {
                            match serde_json::to_string(&report) {
                                Ok(json) => eprintln!("{}", json),
                                Err(e) => eprintln!("Failed to serialize report: {}", e),
                            }
                            report
                        })
                }
            };

            match result {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => fail(e.to_string()),
            }
        }

        Commands::Update {
            catalog,
            ledger,
            ids,
        } => {
            let catalog = match JsonCatalog::load(&catalog) {
                Ok(c) => c,
                Err(e) => return fail(e.to_string()),
            };
            let mut registrar = LedgerRegistrar::new(ledger);

            match pipeline.update_publish(&ids, &catalog, &mut registrar) {
                Ok(report) => {
                    print_json(&report);
                    if report.all_updated() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2) // Some records were skipped or failed
                    }
                }
                Err(e) => {
                    print_json(&serde_json::json!({
                        "success": false,
                        "error": e.to_string(),
                    }));
                    ExitCode::from(2)
                }
            }
        }
    }
}
