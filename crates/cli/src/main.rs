use clap::{Parser, Subcommand};
use couch_store::ViewQuery;
use ngs_core::{
    catalog, consistency, records, sequencer, CoreConfig, PipelineService, Session,
};
use ngs_types::DocId;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ngs")]
#[command(about = "NGS run tracker CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database if needed and install indexes and singletons
    Bootstrap,
    /// Index run folders in the sequencer output directory
    IndexRuns {
        /// Directory to scan (defaults to MISEQ_OUTPUT_DIR)
        dir: Option<PathBuf>,
    },
    /// List indexed sequencer runs
    Runs,
    /// List examinations awaiting the pipeline
    NewExaminations,
    /// Link a patient and an examination
    Link {
        /// Patient document id
        patient_id: String,
        /// Examination document id
        examination_id: String,
    },
    /// Report references to missing, deleted or mistyped documents
    CheckReferences,
    /// Report examinations per external record
    Linkage {
        /// Only show records without exactly one examination
        #[arg(long)]
        problems_only: bool,
    },
    /// Read rows of a view
    Query {
        /// Design document name
        design: String,
        /// View name
        view: String,
        /// Exact key, as JSON
        #[arg(long)]
        key: Option<String>,
        /// Group reduced rows by the first N key elements
        #[arg(long)]
        group_level: Option<usize>,
        /// Skip the reduce function
        #[arg(long)]
        no_reduce: bool,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print a stored document
    Show {
        /// Document id
        id: String,
    },
    /// Show pipeline progress
    PipelineStatus,
    /// Run the pipeline and wait for it to finish
    StartPipeline {
        /// Input sample files
        inputs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = Arc::new(CoreConfig::from_lookup(|key| std::env::var(key).ok())?);
    let store = cfg.open_store()?;

    match cli.command {
        Some(Commands::Bootstrap) => {
            let session = Session::new(store).initialise_database().await?;
            let report = catalog::bootstrap(&session).await?;
            println!(
                "Installed: {:?}, updated: {:?}, unchanged: {:?}, singletons created: {:?}",
                report.installed, report.updated, report.unchanged, report.singletons_created
            );
        }
        Some(Commands::IndexRuns { dir }) => {
            let Some(dir) = dir.or_else(|| cfg.sequencer_output_dir().map(PathBuf::from)) else {
                eprintln!("No directory given and MISEQ_OUTPUT_DIR is not set.");
                return Ok(());
            };
            let session = Session::new(store).connect().await?;
            let report = sequencer::index_sequencer_output(&session, &dir).await?;
            for name in &report.indexed {
                println!("indexed  {name}");
            }
            for name in &report.dirty {
                println!("dirty    {name}");
            }
            for (name, err) in &report.failed {
                eprintln!("failed   {name}: {err}");
            }
            println!("{} already indexed", report.already_indexed);
        }
        Some(Commands::Runs) => {
            let session = Session::new(store).connect().await?;
            let names = sequencer::run_names(&session).await?;
            if names.is_empty() {
                println!("No sequencer runs indexed.");
            }
            for name in names {
                println!("{name}");
            }
        }
        Some(Commands::NewExaminations) => {
            let session = Session::new(store).connect().await?;
            for doc in records::new_examinations(&session).await? {
                if let Some(exam) = doc.as_examination() {
                    println!(
                        "ID: {}, Type: {}, Started: {}, Runs: {}",
                        doc.id(),
                        exam.examination_type,
                        exam.started_date,
                        exam.sequencer_runs.len()
                    );
                }
            }
        }
        Some(Commands::Link {
            patient_id,
            examination_id,
        }) => {
            let session = Session::new(store).connect().await?;
            let patient_id = DocId::new(patient_id)?;
            let examination_id = DocId::new(examination_id)?;
            match records::link_patient_examination(&session, &patient_id, &examination_id).await
            {
                Ok(_) => println!("Linked patient {patient_id} and examination {examination_id}"),
                Err(e) => eprintln!("Error linking records: {}", e),
            }
        }
        Some(Commands::CheckReferences) => {
            let session = Session::new(store).connect().await?;
            let dangling = consistency::check_references(&session).await?;
            if dangling.is_empty() {
                println!("All references resolve.");
            }
            for d in dangling {
                println!("{}.{} -> {}: {:?}", d.owner, d.field, d.target, d.problem);
            }
        }
        Some(Commands::Linkage { problems_only }) => {
            let session = Session::new(store).connect().await?;
            for l in records::filemaker_linkage(&session).await? {
                if problems_only && l.is_consistent() {
                    continue;
                }
                println!(
                    "{}: {} examination(s){}",
                    l.record_id,
                    l.examinations,
                    if l.record_present { "" } else { " (record missing)" }
                );
            }
        }
        Some(Commands::Query {
            design,
            view,
            key,
            group_level,
            no_reduce,
            descending,
            limit,
        }) => {
            let session = Session::new(store).connect().await?;
            let mut query = ViewQuery::new().descending(descending);
            if let Some(key) = key {
                query = query.key(serde_json::from_str::<serde_json::Value>(&key)?);
            }
            if let Some(level) = group_level {
                query = query.group_level(level);
            }
            if no_reduce {
                query = query.reduce(false);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            for row in session.query(&design, &view, &query).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Some(Commands::Show { id }) => {
            let session = Session::new(store).connect().await?;
            let raw = session.get_raw(&id).await?;
            println!("{}", serde_json::to_string_pretty(&raw)?);
        }
        Some(Commands::PipelineStatus) => {
            let pipeline = PipelineService::new(cfg.clone(), store);
            println!("Progress: {}%", pipeline.fetch_progress().await);
        }
        Some(Commands::StartPipeline { inputs }) => {
            let pipeline = PipelineService::new(cfg.clone(), store);
            let handle = pipeline.start(inputs).await?;
            println!("Started pipeline run {}", handle.run_id);
            let status = handle.completion.await??;
            println!("Pipeline finished: {:?}", status);
        }
        None => {
            println!("No command given. Use --help for usage.");
        }
    }

    Ok(())
}
