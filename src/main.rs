use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};

use beiwe_pipeline::backend;
use beiwe_pipeline::directory;
use beiwe_pipeline::pipeline::config::{ConfigResolver, InvocationContext};
use beiwe_pipeline::pipeline::setup::{self, ProvisionInputs, RetryPolicy};
use beiwe_pipeline::pipeline::submit::SubmissionRequest;
use beiwe_pipeline::pipeline::{trigger, Frequency, Pipeline, StringList, UnknownFrequency, API_TIME_FORMAT};
use beiwe_pipeline::scheduler::Scheduler;
use beiwe_pipeline::settings::{AppSettings, CONFIG_ENV_VAR};
use beiwe_pipeline::storage;
use beiwe_pipeline::tracking::TrackingStore;

#[derive(Parser)]
#[command(
    name = "beiwe-pipeline",
    about = "Data pipeline job submission and execution tracking for Beiwe",
    version,
    long_about = None
)]
struct Cli {
    /// Settings file (TOML). Defaults to $BEIWE_PIPELINE_CONFIG, then the system path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + frequency scheduler)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Rotate the batch user credentials of a frequency
    Rotate {
        #[arg(long, value_parser = parse_frequency)]
        freq: Frequency,
    },

    /// Submit one job for a study
    Submit {
        /// Study id
        #[arg(long)]
        study: i64,

        #[arg(long)]
        owner: String,

        /// run_pipeline or copy_to_box
        #[arg(long, default_value = "run_pipeline")]
        job_type: String,

        #[arg(long, value_parser = parse_frequency, default_value = "manually")]
        freq: Frequency,

        /// Comma or space separated participant ids
        #[arg(long, default_value = "")]
        participants: String,

        #[arg(long, default_value = "")]
        datastreams: String,

        /// Notification recipients
        #[arg(long, default_value = "")]
        emails: String,

        /// Start of the data range (RFC 3339 or YYYY-MM-DDTHH:MM:SS, UTC)
        #[arg(long, value_parser = parse_time)]
        start: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_time)]
        end: Option<DateTime<Utc>>,

        #[arg(long)]
        box_directory: Option<String>,

        /// Rotate credentials before submitting
        #[arg(long)]
        rotate: bool,
    },

    /// Rotate credentials and submit a job for every study
    Trigger {
        #[arg(long, value_parser = parse_frequency)]
        freq: Frequency,
    },

    /// Terminate a tracked job
    Terminate {
        /// Pipeline execution id
        #[arg(long)]
        id: i64,

        /// Who is asking, recorded in the reason
        #[arg(long)]
        user: String,
    },

    /// Show one execution record
    Status {
        #[arg(long)]
        id: i64,
    },

    /// List execution records of a study, newest first
    List {
        #[arg(long)]
        study: i64,
    },

    /// Manage studies
    Study {
        #[command(subcommand)]
        action: StudyAction,
    },

    /// Inspect the frequency schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Create the compute environment, job queue and job definition
    Setup {
        /// Container image repository URI
        #[arg(long)]
        repo_uri: String,

        /// Machine image id for the compute environment
        #[arg(long)]
        ami_id: String,

        /// Directory with compute-environment.json and container-props.json
        #[arg(long)]
        configs_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum StudyAction {
    /// Register a study
    Add {
        #[arg(long)]
        object_id: String,

        #[arg(long)]
        name: String,
    },

    /// List studies that have not been deleted
    List,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn parse_frequency(s: &str) -> Result<Frequency, String> {
    s.parse().map_err(|e: UnknownFrequency| e.to_string())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, API_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

fn load_settings(cli: &Cli) -> Result<AppSettings> {
    let mut settings = match &cli.config {
        Some(path) => AppSettings::load(path)?,
        None => AppSettings::load_or_default(),
    };
    if let Some(db) = &cli.db {
        settings.storage.db_path = db.clone();
    }
    Ok(settings)
}

fn init_tracing(settings: &AppSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if settings.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_pipeline(settings: &AppSettings) -> Result<Pipeline> {
    let pool = storage::open_pool(&settings.storage.db_path.to_string_lossy())?;
    let backends = backend::connect(&settings.backend)?;
    Ok(Pipeline::new(pool, backends))
}

fn resolver(settings: &AppSettings) -> ConfigResolver {
    ConfigResolver::new(settings.pipeline.object_names_path.clone())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_tracing(&settings);
    tracing::debug!(env_var = CONFIG_ENV_VAR, "settings resolved");

    match cli.command {
        Commands::Serve { bind } => {
            let mut settings = settings;
            if let Some(bind) = bind {
                settings.server.bind = bind;
            }
            tracing::info!(bind = %settings.server.bind, "Starting beiwe-pipeline daemon");
            let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            runtime.block_on(beiwe_pipeline::serve(settings))?;
        }
        Commands::Rotate { freq } => {
            let pipeline = open_pipeline(&settings)?;
            let config = resolver(&settings).resolve_for(InvocationContext::Script)?;
            let report = pipeline.rotate(&config, freq)?;
            println!(
                "Rotated credentials for '{}' ({} new study grants), published to {} and {}",
                report.username, report.new_grants, report.access_key_parameter, report.secret_key_parameter
            );
        }
        Commands::Submit {
            study,
            owner,
            job_type,
            freq,
            participants,
            datastreams,
            emails,
            start,
            end,
            box_directory,
            rotate,
        } => {
            let pipeline = open_pipeline(&settings)?;
            let config = resolver(&settings).resolve_for(InvocationContext::Script)?;
            if rotate {
                pipeline.rotate(&config, freq)?;
            }
            let request = SubmissionRequest {
                owner,
                study_id: study,
                job_type,
                email_addresses: StringList::Single(emails),
                data_start: start,
                data_end: end,
                participants: StringList::Single(participants),
                datastreams: StringList::Single(datastreams),
                box_directory,
            };
            let outcome = pipeline.submit(&config, freq, &request)?;
            println!(
                "Submitted pipeline {} as batch job {}",
                outcome.pipeline_id, outcome.batch_job_id
            );
        }
        Commands::Trigger { freq } => {
            let pipeline = open_pipeline(&settings)?;
            match trigger::trigger(&pipeline, &resolver(&settings), InvocationContext::Script, freq) {
                Ok(report) => {
                    println!(
                        "Submitted {} of {} studies for {}",
                        report.submitted.len(),
                        report.attempted,
                        freq
                    );
                }
                Err(e) => {
                    for captured in &e.errors {
                        eprintln!("[{}] {}", captured.event_id, captured.error);
                    }
                    return Err(e.into());
                }
            }
        }
        Commands::Terminate { id, user } => {
            let pipeline = open_pipeline(&settings)?;
            let reason = pipeline.terminate(id, &user)?;
            println!("Pipeline {} terminated ({})", id, reason);
        }
        Commands::Status { id } => {
            let pool = storage::open_pool(&settings.storage.db_path.to_string_lossy())?;
            let record = TrackingStore::new(pool).get(id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { study } => {
            let pool = storage::open_pool(&settings.storage.db_path.to_string_lossy())?;
            let records = TrackingStore::new(pool).list_for_study(study)?;
            if records.is_empty() {
                println!("No pipeline executions for study {}.", study);
            } else {
                println!("{:<6} | {:<12} | {:<12} | {:<25} | Batch job", "Id", "Status", "Type", "Requested");
                println!("{:-<6}-|-{:-<12}-|-{:-<12}-|-{:-<25}-|-{:-<20}", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<6} | {:<12} | {:<12} | {:<25} | {}",
                        r.id,
                        r.status.as_str(),
                        r.job_type.as_str(),
                        r.requested_at.to_rfc3339(),
                        r.batch_job_id.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Study { action } => {
            let pool = storage::open_pool(&settings.storage.db_path.to_string_lossy())?;
            let conn = pool.get()?;
            match action {
                StudyAction::Add { object_id, name } => {
                    let study = directory::create_study(&conn, &object_id, &name)?;
                    println!("Study '{}' added with id {}.", study.name, study.id);
                }
                StudyAction::List => {
                    let studies = directory::list_studies(&conn)?;
                    if studies.is_empty() {
                        println!("No studies found.");
                    } else {
                        println!("{:<6} | {:<26} | Name", "Id", "Object id");
                        println!("{:-<6}-|-{:-<26}-|-{:-<20}", "", "", "");
                        for s in studies {
                            println!("{:<6} | {:<26} | {}", s.id, s.object_id, s.name);
                        }
                    }
                }
            }
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::DryRun { hours } => {
                let scheduler = Scheduler::new(&settings.schedule.frequencies)?;
                let preview = scheduler.preview_next_runs(Utc::now(), hours);
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for run in preview {
                        println!("{} : {}", run.at.to_rfc3339(), run.freq);
                    }
                }
            }
        },
        Commands::Setup {
            repo_uri,
            ami_id,
            configs_dir,
        } => {
            if repo_uri.trim().is_empty() || ami_id.trim().is_empty() {
                bail!("--repo-uri and --ami-id must not be empty");
            }
            let configs_dir = configs_dir.unwrap_or_else(|| settings.setup.configs_dir.clone());
            let config = resolver(&settings).resolve_for(InvocationContext::Script)?;
            let inputs = ProvisionInputs::load(&configs_dir, &repo_uri, &ami_id)?
                .with_default_region(settings.pipeline.region_name.clone());
            let backends = backend::connect(&settings.backend)?;

            let report = setup::provision(
                backends.provisioner.as_ref(),
                &config,
                inputs,
                RetryPolicy::from(&settings.setup),
            )?;

            println!("\nSettings your Beiwe server needs:");
            println!("  comp_env_name = {}", report.comp_env_name);
            println!("  queue_name    = {}", report.queue_name);
            println!("  job_defn_name = {}", report.job_defn_name);
        }
    }

    Ok(())
}
