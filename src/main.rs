mod bus;
mod config;
mod db;
mod logging;
mod models;
mod poller;
mod relay;
mod store;
mod tui;
mod webhook;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::Config;
use db::Database;
use models::{demo_job_match, JobMatchPayload};
use serde_json::Value;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use store::Store;
use webhook::{ThreadFetch, WebhookClient};

#[derive(Parser)]
#[command(name = "mailtrix")]
#[command(about = "Recruiter dashboard for automated job matches and candidate conversations")]
struct Cli {
    /// Path to the local database (defaults to MAILTRIX_DB, then the user data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP relay for the automation workflow
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Stage accepted payloads in the local database for the dashboard
        #[arg(long)]
        stage: bool,
    },

    /// Apply staged payloads to local state until interrupted
    Watch,

    /// Import job matches from a JSON file ("-" reads stdin)
    Import {
        /// File holding one job match or an array of them
        source: String,
    },

    /// Add a demo job match
    Demo,

    /// List job matches
    List,

    /// Show a job match with its candidates
    Show {
        job_id: String,
    },

    /// Approve a candidate
    Approve {
        job_id: String,
        candidate_id: String,
    },

    /// Reject a candidate
    Reject {
        job_id: String,
        candidate_id: String,
    },

    /// Set the status of a job match
    JobStatus {
        job_id: String,
        status: String,
    },

    /// Send approved candidates back to the workflow
    SendApprovals {
        job_id: String,

        /// Notes for the recruiter
        #[arg(short, long, default_value = "")]
        notes: String,
    },

    /// Send a reply into the job's conversation
    Reply {
        job_id: String,
        body: String,
    },

    /// Show the conversation for a job
    Threads {
        job_id: String,

        /// Fetch the latest history through the relay first
        #[arg(short, long)]
        refresh: bool,
    },

    /// Mark every message of a job as read
    MarkRead {
        job_id: String,
    },

    /// Remove a job match and its conversation
    Remove {
        job_id: String,
    },

    /// Remove all job matches and conversations
    Clear,

    /// Open the terminal dashboard
    Browse,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init(!matches!(cli.command, Commands::Browse));
    let config = Config::from_env()?;
    let db_path = cli.db.clone().or_else(|| config.db_path.clone());

    match cli.command {
        Commands::Serve { bind, stage } => {
            let staging = if stage || config.stage {
                Some(open_db(db_path.as_deref())?)
            } else {
                None
            };
            let bind = bind.unwrap_or(config.bind);
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(relay::serve(&config, bind, staging))?;
        }

        Commands::Watch => {
            let mut store = Store::init(open_db(db_path.as_deref())?);
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(poller::watch(&mut store, config.poll_interval))?;
        }

        Commands::Import { source } => {
            let mut store = open_store(db_path.as_deref())?;
            let payloads = read_payloads(&source)?;
            let mut imported = 0;
            for payload in payloads {
                if payload.candidates.is_none() {
                    println!("Skipping job {}: no candidates.", payload.job_id);
                    continue;
                }
                store.upsert_job_match(payload);
                imported += 1;
            }
            println!("Imported {} job match(es).", imported);
        }

        Commands::Demo => {
            let mut store = open_store(db_path.as_deref())?;
            let job_id = format!("JOB{}", Utc::now().timestamp_millis());
            store.upsert_job_match(demo_job_match(job_id.clone()));
            println!("Added demo job {}.", job_id);
        }

        Commands::List => {
            let store = open_store(db_path.as_deref())?;
            let jobs = store.jobs();
            if jobs.is_empty() {
                println!("No job matches found.");
            } else {
                println!(
                    "{:<16} {:<30} {:>6} {:>8} {:>7} {:<10}",
                    "JOB ID", "TITLE", "CANDS", "PENDING", "UNREAD", "STATUS"
                );
                println!("{}", "-".repeat(82));
                for job in jobs {
                    println!(
                        "{:<16} {:<30} {:>6} {:>8} {:>7} {:<10}",
                        truncate(&job.job_id, 16),
                        truncate(job.title(), 28),
                        job.candidates.len(),
                        job.pending_count(),
                        job.unread_count,
                        job.status.as_deref().unwrap_or("-")
                    );
                }
                let stats = store.stats();
                println!(
                    "\n{} job(s), {} pending approval(s)",
                    stats.total_jobs, stats.pending_approvals
                );
            }
        }

        Commands::Show { job_id } => {
            let store = open_store(db_path.as_deref())?;
            match store.job(&job_id) {
                Some(job) => {
                    println!("Job {}", job.job_id);
                    println!("Title: {}", job.title());
                    if let Some(location) = &job.job_location {
                        println!("Location: {}", location);
                    }
                    match (&job.recruiter_name, &job.recruiter_email) {
                        (Some(name), Some(email)) => println!("Recruiter: {} <{}>", name, email),
                        (Some(who), None) | (None, Some(who)) => println!("Recruiter: {}", who),
                        (None, None) => {}
                    }
                    if !job.required_skills.is_empty() {
                        println!("Skills: {}", job.required_skills.join(", "));
                    }
                    if let Some(years) = job.min_experience {
                        println!("Min experience: {} yrs", years);
                    }
                    if let Some(status) = &job.status {
                        println!("Status: {}", status);
                    }
                    if let Some(received) = job.received_at.as_ref().or(job.created_at.as_ref()) {
                        println!("Received: {}", received);
                    }
                    println!("Messages: {} ({} unread)", job.thread_count, job.unread_count);

                    println!("\nCandidates ({}):", job.candidates.len());
                    for c in &job.candidates {
                        let score = c
                            .match_score
                            .map(|s| format!("{:.0} {}", s, c.score_tier().label()))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {:<10} {:<9} {:<24} {}",
                            c.candidate_id,
                            c.status,
                            truncate(c.candidate_name.as_deref().unwrap_or("?"), 22),
                            score
                        );
                        if let Some(reason) = &c.match_reason {
                            println!("             {}", reason);
                        }
                    }
                }
                None => {
                    println!("Job {} not found.", job_id);
                }
            }
        }

        Commands::Approve { job_id, candidate_id } => {
            let mut store = open_store(db_path.as_deref())?;
            set_candidate_status(&mut store, &job_id, &candidate_id, models::STATUS_APPROVED)?;
        }

        Commands::Reject { job_id, candidate_id } => {
            let mut store = open_store(db_path.as_deref())?;
            set_candidate_status(&mut store, &job_id, &candidate_id, models::STATUS_REJECTED)?;
        }

        Commands::JobStatus { job_id, status } => {
            let mut store = open_store(db_path.as_deref())?;
            if !store.set_job_status(&job_id, &status) {
                bail!("Job {} not found", job_id);
            }
            println!("Job {} marked {}.", job_id, status);
        }

        Commands::SendApprovals { job_id, notes } => {
            let store = open_store(db_path.as_deref())?;
            if store.job(&job_id).is_none() {
                bail!("Job {} not found", job_id);
            }
            let webhook = WebhookClient::from_config(&config);
            let sent = webhook.send_approvals(&job_id, &store.approved_candidates(&job_id), &notes)?;
            println!("Sent {} approval(s) for job {}.", sent, job_id);
        }

        Commands::Reply { job_id, body } => {
            let store = open_store(db_path.as_deref())?;
            if store.job(&job_id).is_none() {
                bail!("Job {} not found", job_id);
            }
            let webhook = WebhookClient::from_config(&config);
            webhook.send_reply(&job_id, &body)?;
            println!("Reply sent for job {}.", job_id);
        }

        Commands::Threads { job_id, refresh } => {
            let mut store = open_store(db_path.as_deref())?;
            if refresh {
                let webhook = WebhookClient::from_config(&config);
                match webhook.fetch_threads(&job_id)? {
                    ThreadFetch::Messages(messages) => store.replace_threads(&job_id, messages),
                    ThreadFetch::Fallback(message) => println!("{}", message),
                }
            }

            let messages = store.threads_for(&job_id);
            if messages.is_empty() {
                println!("No messages for job {}.", job_id);
            } else {
                for message in tui::sorted_messages(messages) {
                    let arrow = match message.direction {
                        models::Direction::Inbound => "<-",
                        models::Direction::Outbound => "->",
                    };
                    let unread = if message.is_unread_inbound() { " (unread)" } else { "" };
                    println!(
                        "{} {} {}{}",
                        arrow,
                        message.display_name(),
                        message.sent_at.as_deref().unwrap_or(""),
                        unread
                    );
                    for line in textwrap::fill(&message.plain_text(), 76).lines() {
                        println!("   {}", line);
                    }
                    println!();
                }
            }
        }

        Commands::MarkRead { job_id } => {
            let mut store = open_store(db_path.as_deref())?;
            if store.mark_threads_read(&job_id) {
                println!("Marked messages for job {} as read.", job_id);
            } else {
                println!("No messages for job {}.", job_id);
            }
        }

        Commands::Remove { job_id } => {
            let mut store = open_store(db_path.as_deref())?;
            if store.remove_job(&job_id) {
                println!("Removed job {}.", job_id);
            } else {
                println!("Job {} not found.", job_id);
            }
        }

        Commands::Clear => {
            let mut store = open_store(db_path.as_deref())?;
            let count = store.jobs().len();
            store.clear_all();
            println!("Removed {} job match(es).", count);
        }

        Commands::Browse => {
            let mut store = open_store(db_path.as_deref())?;
            let webhook = WebhookClient::from_config(&config);
            tui::run_browse(&mut store, &webhook, config.poll_interval)?;
        }
    }

    Ok(())
}

fn open_db(path: Option<&Path>) -> Result<Database> {
    match path {
        Some(path) => Database::open_at(path),
        None => Database::open(),
    }
}

/// Opens local state with anything the relay has staged already applied.
fn open_store(path: Option<&Path>) -> Result<Store> {
    let mut store = Store::init(open_db(path)?);
    poller::poll_once(&mut store);
    Ok(store)
}

fn set_candidate_status(store: &mut Store, job_id: &str, candidate_id: &str, status: &str) -> Result<()> {
    if !store.update_candidate_status(job_id, candidate_id, status) {
        bail!("Candidate {} not found in job {}", candidate_id, job_id);
    }
    println!("Marked {} as {} for job {}.", candidate_id, status, job_id);
    Ok(())
}

fn read_payloads(source: &str) -> Result<Vec<JobMatchPayload>> {
    let content = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {}", source))?
    };
    parse_payloads(&content)
}

fn parse_payloads(content: &str) -> Result<Vec<JobMatchPayload>> {
    let value: Value = serde_json::from_str(content).context("Input is not valid JSON")?;
    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item).with_context(|| format!("Job match #{} is malformed", i + 1))
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
