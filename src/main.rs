//! gitxa - command-line front end
//!
//! Runs the coordinator against a git transaction log and a git document
//! store. Every invocation is a fresh process, so commands that act on an
//! active transaction reload the log first.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{warn, Level};

use gitxa::resource::{GitBranch, GitResourceManager};
use gitxa::storage::{CollectionName, Document, DocumentKey};
use gitxa::telemetry::{self, LogFormat};
use gitxa::transaction::{CoordinatorConfig, CoordinatorError, TransactionCoordinator};
use gitxa::txlog::{GitTransactionLog, TransactionLog, TransactionRecord};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(author, version, about = "Two-phase commit over git-backed stores", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding both `log/` and `store/`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Transaction log repository (overrides the configuration)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Participant store repository (overrides the configuration)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an order and its payment in one distributed transaction
    Demo {
        order_no: String,
        /// Payment amount in cents
        #[arg(long, default_value_t = 100)]
        amount: u64,
        /// Stop the flow at this step
        #[arg(long, value_enum)]
        fail_at: Option<FailAt>,
    },
    /// Status of an active transaction
    Status { xid: String },
    /// Logged record of any transaction
    Show { xid: String },
    /// Transactions not yet committed or rolled back
    Pending,
    /// Reload pending transactions from the log
    Recover,
    /// Prepared transactions awaiting a decision
    InDoubt,
    /// Commit a pending transaction
    Commit { xid: String },
    /// Roll back a pending transaction
    Rollback { xid: String },
    /// Purge finished records older than a unix timestamp
    Cleanup {
        #[arg(long)]
        before: u64,
    },
    /// Commits in the log that touched a transaction
    History { xid: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FailAt {
    /// the payment write fails; the transaction is rolled back
    Write,
    /// stop before prepare, leaving the transaction STARTED
    Prepare,
    /// stop before commit, leaving the transaction PREPARED
    Commit,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    if let Err(e) = telemetry::init_logging(level, format) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> CliResult<CoordinatorConfig> {
    let mut config = match &cli.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(root) = &cli.data_dir {
        config = config.data_dir(root);
    }
    if let Some(path) = &cli.log_dir {
        config.log_path = path.clone();
    }
    if let Some(path) = &cli.store_dir {
        config.store_path = path.clone();
    }
    Ok(config)
}

fn open(config: CoordinatorConfig) -> CliResult<(TransactionCoordinator<GitResourceManager>, Arc<GitTransactionLog>)> {
    let log = Arc::new(GitTransactionLog::open_or_init(&config.log_path)?);
    let rm = GitResourceManager::open_or_init("store", &config.store_path)?;
    let coordinator = TransactionCoordinator::new(config, rm, log.clone())?;
    Ok((coordinator, log))
}

fn run(cli: Cli) -> CliResult<()> {
    let config = load_config(&cli)?;
    let (coordinator, log) = open(config)?;

    match cli.command {
        Command::Demo {
            order_no,
            amount,
            fail_at,
        } => demo(&coordinator, &order_no, amount, fail_at)?,
        Command::Status { xid } => {
            coordinator.recover_transactions()?;
            println!("{}", coordinator.get_transaction_status(&xid)?);
        }
        Command::Show { xid } => match log.get(&xid)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => return Err(format!("no record for {}", xid).into()),
        },
        Command::Pending => {
            coordinator.recover_transactions()?;
            print_records(&coordinator.get_pending_transactions());
        }
        Command::Recover => {
            let report = coordinator.recover_transactions()?;
            println!(
                "recovered {} transaction(s): {} started, {} prepared",
                report.loaded.len(),
                report.started,
                report.prepared
            );
            for xid in &report.loaded {
                println!("  {}", xid);
            }
        }
        Command::InDoubt => {
            let report = coordinator.in_doubt_transactions()?;
            if report.is_empty() {
                println!("(none)");
            }
            for entry in &report.transactions {
                let participant = if entry.participant_prepared {
                    "prepared"
                } else {
                    "not prepared"
                };
                println!(
                    "{}\t{}\t{}\tparticipant {}",
                    entry.record.xid, entry.record.status, entry.record.order_no, participant
                );
            }
            for xid in &report.orphaned {
                println!("{}\t(no log record)\tparticipant prepared", xid);
            }
        }
        Command::Commit { xid } => {
            coordinator.recover_transactions()?;
            let committed = coordinator.commit_transaction(&xid)?;
            println!("{}", if committed { "COMMITTED" } else { "FAILED" });
        }
        Command::Rollback { xid } => {
            coordinator.recover_transactions()?;
            let rolled_back = coordinator.rollback_transaction(&xid)?;
            println!("{}", if rolled_back { "ROLLED_BACK" } else { "FAILED" });
        }
        Command::Cleanup { before } => {
            let removed = coordinator.cleanup_transactions(before)?;
            println!("{} record(s) removed", removed);
        }
        Command::History { xid } => {
            let trail = log.audit_trail(&xid)?;
            if trail.is_empty() {
                println!("(no commits)");
            }
            for commit in &trail {
                println!(
                    "{}  {}  {}",
                    commit.id.short(),
                    commit.timestamp.to_rfc3339(),
                    commit.summary()
                );
            }
        }
    }
    Ok(())
}

fn demo(
    coordinator: &TransactionCoordinator<GitResourceManager>,
    order_no: &str,
    amount: u64,
    fail_at: Option<FailAt>,
) -> CliResult<()> {
    let orders = CollectionName::new("orders")?;
    let payments = CollectionName::new("payments")?;
    let key = DocumentKey::new(order_no)?;

    let order = Document::from_value(
        key.clone(),
        json!({ "order_no": order_no, "amount": amount, "status": "CREATED" }),
    )?;
    let payment = Document::from_value(
        key,
        json!({ "order_no": order_no, "amount": amount, "status": "PAID" }),
    )?;

    let tx = coordinator.start_transaction(order_no)?;
    let xid = tx.xid().to_string();
    println!("started {}", xid);

    let written = tx.with_branch(|branch: &mut GitBranch| {
        branch.upsert(&orders, order)?;
        if fail_at == Some(FailAt::Write) {
            return Ok(false);
        }
        branch.upsert(&payments, payment)?;
        Ok(true)
    });
    let written = written.map_err(|e| abandon(coordinator, &xid, e))?;
    if !written {
        coordinator.rollback_transaction(&xid)?;
        println!("payment write failed, {} rolled back", xid);
        return Ok(());
    }

    if fail_at == Some(FailAt::Prepare) {
        println!("stopped before prepare, {} left STARTED", xid);
        return Ok(());
    }
    let prepared = coordinator
        .prepare_transaction(&xid)
        .map_err(|e| abandon(coordinator, &xid, e))?;
    if !prepared {
        coordinator.rollback_transaction(&xid)?;
        println!("participant voted abort, {} rolled back", xid);
        return Ok(());
    }

    if fail_at == Some(FailAt::Commit) {
        println!("stopped before commit, {} left PREPARED", xid);
        return Ok(());
    }
    if coordinator.commit_transaction(&xid)? {
        println!("committed {}", xid);
    } else {
        println!("commit rejected, {} marked FAILED", xid);
    }
    Ok(())
}

/// Roll `xid` back after a failure before the commit and return the failure.
fn abandon(
    coordinator: &TransactionCoordinator<GitResourceManager>,
    xid: &str,
    err: CoordinatorError,
) -> CoordinatorError {
    match coordinator.rollback_transaction(xid) {
        Ok(_) => eprintln!("{} failed, {} rolled back", err, xid),
        Err(rollback_err) => warn!(xid, error = %rollback_err, "rollback after failure did not complete"),
    }
    err
}

fn print_records(records: &[TransactionRecord]) {
    if records.is_empty() {
        println!("(0 transactions)");
        return;
    }
    println!("xid\tstatus\torder_no\tcreated");
    for record in records {
        println!(
            "{}\t{}\t{}\t{}",
            record.xid, record.status, record.order_no, record.create_time
        );
    }
    println!("({} transactions)", records.len());
}
