//! Rollchain - check-in sessions backed by a hash-chained attendance ledger
//!
//! Operator CLI over `rollchain-core`. Every run loads the persisted state,
//! starts the service (which reconciles the store first), executes one
//! command, saves, and prints JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use rollchain_core::model::{Claimant, LedgerBlock};
use rollchain_core::{CheckinConfig, CheckinError};

mod state;

use state::{StatePaths, Workspace};

/// How long a run waits for another run to release the state directory
const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "rollchain",
    about = "Issue check-in sessions and record attendance on a hash-chained ledger",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// YAML configuration file
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the store and local bridge snapshots
    #[clap(long, global = true)]
    state: Option<PathBuf>,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    log_json: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Manage classes
    Class {
        #[clap(subcommand)]
        command: ClassCommand,
    },

    /// Manage check-in sessions
    Session {
        #[clap(subcommand)]
        command: SessionCommand,
    },

    /// Submit an attendance claim with a session token
    Attend {
        /// Secret token as rendered in the session QR code
        #[clap(long)]
        token: String,

        /// Claimant id
        #[clap(long)]
        student: String,

        /// Claimant display name, included in the published blob
        #[clap(long)]
        name: Option<String>,

        /// Claimant wallet, included in the ledger event
        #[clap(long)]
        wallet: Option<String>,
    },

    /// Show whether a student's claim is recorded for a session
    Attended {
        #[clap(long)]
        session: String,

        #[clap(long)]
        student: String,
    },

    /// Inspect session tokens
    Token {
        #[clap(subcommand)]
        command: TokenCommand,
    },

    /// List attendance records for a student or a class
    Records {
        #[clap(long, conflicts_with = "class", required_unless_present = "class")]
        student: Option<String>,

        #[clap(long)]
        class: Option<String>,
    },

    /// Retrieve a published attendance blob by content address
    Content { address: String },

    /// Inspect and audit the ledger
    Ledger {
        #[clap(subcommand)]
        command: LedgerCommand,
    },

    /// Run startup reconciliation and report what it did
    Reconcile,
}

#[derive(Parser, Debug)]
enum ClassCommand {
    /// Create a class
    Create {
        #[clap(long)]
        name: String,

        #[clap(long)]
        code: String,

        #[clap(long)]
        teacher: String,
    },

    /// Enroll a student (no-op if already enrolled)
    Enroll {
        #[clap(long)]
        class: String,

        #[clap(long)]
        student: String,
    },

    /// List a teacher's classes or a student's enrolled classes
    List {
        #[clap(long, conflicts_with = "student", required_unless_present = "student")]
        teacher: Option<String>,

        #[clap(long)]
        student: Option<String>,
    },

    /// Print the roster of a class
    Students {
        #[clap(long)]
        class: String,
    },
}

#[derive(Parser, Debug)]
enum SessionCommand {
    /// Issue a session and print its token
    Issue {
        #[clap(long)]
        class: String,

        #[clap(long)]
        issuer: String,

        /// Override the configured lifetime
        #[clap(long)]
        ttl_minutes: Option<i64>,
    },
}

#[derive(Parser, Debug)]
enum TokenCommand {
    /// Check a token's format without looking it up
    Check { token: String },
}

#[derive(Parser, Debug)]
enum LedgerCommand {
    /// Print blocks as a table
    Show {
        #[clap(long, default_value_t = 1)]
        from: u64,

        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Recompute every hash and link
    Verify,

    /// List attendance blocks with no persisted record
    Orphans,
}

#[derive(Tabled)]
struct BlockRow {
    #[tabled(rename = "#")]
    number: u64,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Previous")]
    previous: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Student")]
    student: String,
    #[tabled(rename = "Created")]
    created: String,
}

impl From<&LedgerBlock> for BlockRow {
    fn from(block: &LedgerBlock) -> Self {
        let field = |name: &str| {
            block
                .payload
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_string()
        };
        Self {
            number: block.block_number,
            hash: short(&block.hash),
            previous: short(&block.previous_hash),
            action: field("action"),
            student: field("student_id"),
            created: block.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

fn short(hash: &str) -> String {
    hash.chars().take(12).collect()
}

fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// What a command produced: JSON for stdout, or a rendered table
enum Output {
    Json(Value),
    Text(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_tracing(&cli.log_level, cli.log_json);

    let mut config = CheckinConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Command::Session {
        command: SessionCommand::Issue {
            ttl_minutes: Some(ttl),
            ..
        },
    } = &cli.command
    {
        config.session.ttl_minutes = *ttl;
    }

    let paths = StatePaths::resolve(cli.state.as_deref(), &config)?;
    debug!("Using state {:?}", paths);
    let workspace = Workspace::open(config, paths, LOCK_WAIT).await?;

    let result = run(&cli.command, &workspace).await;

    // Failed claims can still change state (e.g. a session deactivated
    // after the anchor refused it), so save regardless.
    workspace.save().await?;

    match result {
        Ok(Output::Json(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
        Ok(Output::Text(text)) => println!("{text}"),
        Err(err) => {
            let body = match err.downcast_ref::<CheckinError>() {
                Some(checkin) => json!({
                    "error": checkin.kind(),
                    "message": checkin.to_string(),
                    "retryable": checkin.is_retryable(),
                }),
                None => json!({"error": "internal", "message": format!("{err:#}")}),
            };
            error!("{:#}", err);
            println!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn run(command: &Command, workspace: &Workspace) -> Result<Output> {
    let service = &workspace.service;

    let value = match command {
        Command::Class { command } => match command {
            ClassCommand::Create {
                name,
                code,
                teacher,
            } => serde_json::to_value(service.create_class(name, code, teacher).await?)?,
            ClassCommand::Enroll { class, student } => {
                let added = service.enroll(class, student).await?;
                json!({"class_id": class, "student_id": student, "newly_enrolled": added})
            }
            ClassCommand::List { teacher, student } => {
                let classes = match (teacher, student) {
                    (Some(teacher), _) => service.classes_for_teacher(teacher).await?,
                    (None, Some(student)) => service.classes_for_student(student).await?,
                    (None, None) => Vec::new(),
                };
                serde_json::to_value(classes)?
            }
            ClassCommand::Students { class } => {
                let students = service.class_roster(class).await?;
                json!({"class_id": class, "students": students})
            }
        },

        Command::Session { command } => match command {
            SessionCommand::Issue { class, issuer, .. } => {
                serde_json::to_value(service.issue_session(class, issuer).await?)?
            }
        },

        Command::Attend {
            token,
            student,
            name,
            wallet,
        } => {
            let claimant = Claimant {
                id: student.clone(),
                name: name.clone(),
                wallet: wallet.clone(),
            };
            serde_json::to_value(service.mark_attendance(token, &claimant).await?)?
        }

        Command::Attended { session, student } => {
            serde_json::to_value(service.attendance_status(session, student).await?)?
        }

        Command::Token { command } => match command {
            TokenCommand::Check { token } => match service.validate_token_format(token) {
                Ok(parsed) => json!({
                    "valid": true,
                    "class_id": parsed.class_id,
                    "session_id": parsed.session_id,
                    "expires_at_epoch": parsed.expires_at_epoch,
                }),
                Err(e) => json!({"valid": false, "reason": e.to_string()}),
            },
        },

        Command::Records { student, class } => {
            let records = match (student, class) {
                (Some(student), _) => service.attendance_for_student(student).await?,
                (None, Some(class)) => service.attendance_for_class(class).await?,
                (None, None) => Vec::new(),
            };
            serde_json::to_value(records)?
        }

        Command::Content { address } => match service.fetch_content(address).await? {
            Some(blob) => blob,
            None => json!({"error": "not_found", "address": address}),
        },

        Command::Ledger { command } => match command {
            LedgerCommand::Show { from, limit } => {
                let blocks = service.ledger_blocks(*from, *limit).await?;
                if blocks.is_empty() {
                    return Ok(Output::Text("Ledger is empty".to_string()));
                }
                let rows: Vec<BlockRow> = blocks.iter().map(BlockRow::from).collect();
                let table = Table::new(&rows)
                    .with(Style::rounded())
                    .with(Modify::new(Rows::first()).with(Alignment::center()))
                    .to_string();
                return Ok(Output::Text(table));
            }
            LedgerCommand::Verify => serde_json::to_value(service.verify_chain().await?)?,
            LedgerCommand::Orphans => serde_json::to_value(service.orphaned_blocks().await?)?,
        },

        Command::Reconcile => serde_json::to_value(service.startup_report())?,
    };

    Ok(Output::Json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_records_requires_a_filter() {
        assert!(Cli::try_parse_from(["rollchain", "records"]).is_err());
        assert!(Cli::try_parse_from(["rollchain", "records", "--student", "S1"]).is_ok());
    }

    #[test]
    fn test_class_list_takes_exactly_one_filter() {
        assert!(Cli::try_parse_from(["rollchain", "class", "list"]).is_err());
        assert!(Cli::try_parse_from(["rollchain", "class", "list", "--teacher", "T1"]).is_ok());
        assert!(Cli::try_parse_from(["rollchain", "class", "list", "--student", "S1"]).is_ok());
        let both = ["rollchain", "class", "list", "--teacher", "T1", "--student", "S1"];
        assert!(Cli::try_parse_from(both).is_err());
    }

    async fn run_json(workspace: &Workspace, args: &[&str]) -> Value {
        let cli = Cli::try_parse_from(args).unwrap();
        match run(&cli.command, workspace).await.unwrap() {
            Output::Json(value) => value,
            Output::Text(text) => panic!("expected JSON, got {text}"),
        }
    }

    #[tokio::test]
    async fn test_class_and_attendance_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckinConfig::default();
        let paths = StatePaths::resolve(Some(dir.path()), &config).unwrap();
        let workspace = Workspace::open(config, paths, Duration::ZERO).await.unwrap();

        let class = workspace
            .service
            .create_class("Networks", "CS-330", "T1")
            .await
            .unwrap();
        let session = workspace.service.issue_session(&class.id, "T1").await.unwrap();
        workspace
            .service
            .mark_attendance(&session.secret_token, &Claimant::new("S1"))
            .await
            .unwrap();

        let listed = run_json(&workspace, &["rollchain", "class", "list", "--teacher", "T1"]).await;
        assert_eq!(listed[0]["code"], "CS-330");

        let joined = run_json(&workspace, &["rollchain", "class", "list", "--student", "S1"]).await;
        assert_eq!(joined.as_array().unwrap().len(), 1);

        let roster = run_json(
            &workspace,
            &["rollchain", "class", "students", "--class", class.id.as_str()],
        )
        .await;
        assert_eq!(roster["students"], json!(["S1"]));

        let status = run_json(
            &workspace,
            &["rollchain", "attended", "--session", session.id.as_str(), "--student", "S1"],
        )
        .await;
        assert_eq!(status["anchored"], true);
        assert!(status["block_hash"].is_string());
    }

    #[test]
    fn test_block_row_shortens_hashes() {
        let block = LedgerBlock {
            id: "b1".to_string(),
            block_number: 1,
            hash: "a".repeat(64),
            previous_hash: "0".to_string(),
            payload: json!({"action": "attendance_marked", "student_id": "S1"}),
            created_at: Utc::now(),
            nonce: 7,
        };
        let row = BlockRow::from(&block);
        assert_eq!(row.hash.len(), 12);
        assert_eq!(row.previous, "0");
        assert_eq!(row.student, "S1");
    }
}
