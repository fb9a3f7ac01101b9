//! R3 CLI
//!
//! Entry point for the `r3` command-line tool. The repository root is
//! passed explicitly to every operation; the CLI resolves it once from
//! `--repository` or the `R3_REPOSITORY` environment variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use r3::{checkout, CheckoutError, Index, IndexError, Repository, StoreError};

#[derive(Parser)]
#[command(name = "r3")]
#[command(about = "Content-addressed repository for reproducible research jobs", version)]
struct Cli {
    /// Repository root (defaults to $R3_REPOSITORY)
    #[arg(long, env = "R3_REPOSITORY", global = true)]
    repository: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init,

    /// Commit a staged job directory
    Commit {
        /// Staged job directory
        source: PathBuf,

        /// Repository root (overrides --repository and $R3_REPOSITORY)
        repo: Option<PathBuf>,
    },

    /// Materialize a committed job into a working directory
    Checkout {
        /// Job identifier
        id: String,

        /// Target directory
        destination: PathBuf,
    },

    /// Recompute job hashes and check integrity invariants
    Verify {
        /// Job identifier (all jobs when omitted)
        id: Option<String>,
    },

    /// Rebuild the metadata index by scanning jobs/
    RebuildIndex,

    /// Remove a job that no other job depends on
    Remove {
        /// Job identifier
        id: String,
    },

    /// Fetch a bare clone without losing pinned commits
    Pull {
        /// Repository URL
        url: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let root = cli.repository;
    match cli.command {
        Commands::Init => {
            let root = match require_root(root) {
                Ok(root) => root,
                Err(code) => return code,
            };
            match Repository::init(&root) {
                Ok(repo) => {
                    println!("Initialized repository at {}", repo.root().display());
                    0
                }
                Err(err) => fail_store(err),
            }
        }
        Commands::Commit { source, repo } => {
            let repo = match open(repo.or(root)) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            match repo.commit(&source) {
                Ok(outcome) if outcome.created => {
                    println!("{}", outcome.id);
                    0
                }
                Ok(outcome) => {
                    println!("{} (exists)", outcome.id);
                    0
                }
                Err(err) => fail_store(err),
            }
        }
        Commands::Checkout { id, destination } => {
            let repo = match open(root) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            match checkout(&repo, &id, &destination) {
                Ok(()) => {
                    println!("Checked out {} to {}", id, destination.display());
                    0
                }
                Err(err) => fail_checkout(err),
            }
        }
        Commands::Verify { id } => {
            let repo = match open(root) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            let ids = match id {
                Some(id) => vec![id],
                None => match repo.job_ids() {
                    Ok(ids) => ids,
                    Err(err) => return fail_store(err),
                },
            };
            for id in &ids {
                if let Err(err) = repo.verify(id) {
                    return fail_store(err);
                }
            }
            println!("ok ({} jobs)", ids.len());
            0
        }
        Commands::RebuildIndex => {
            let repo = match open(root) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            match Index::rebuild(&repo) {
                Ok(index) => {
                    println!("Indexed {} jobs", index.jobs.len());
                    0
                }
                Err(err) => fail_index(err),
            }
        }
        Commands::Remove { id } => {
            let repo = match open(root) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            match repo.remove(&id) {
                Ok(()) => {
                    println!("Removed {}", id);
                    0
                }
                Err(err) => fail_store(err),
            }
        }
        Commands::Pull { url } => {
            let repo = match open(root) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            match repo.pull(&url) {
                Ok(()) => {
                    println!("Pulled {}", url);
                    0
                }
                Err(err) => fail_store(err),
            }
        }
    }
}

fn require_root(root: Option<PathBuf>) -> Result<PathBuf, i32> {
    root.ok_or_else(|| {
        eprintln!("error: no repository given (use --repository or set R3_REPOSITORY)");
        1
    })
}

fn open(root: Option<PathBuf>) -> Result<Repository, i32> {
    let root = require_root(root)?;
    Repository::open(&root).map_err(|err| fail_store(err))
}

fn fail_store(err: StoreError) -> i32 {
    eprintln!("error: {}", err);
    err.exit_code()
}

fn fail_checkout(err: CheckoutError) -> i32 {
    eprintln!("error: {}", err);
    err.exit_code()
}

fn fail_index(err: IndexError) -> i32 {
    eprintln!("error: {}", err);
    match err {
        IndexError::Store(err) => err.exit_code(),
        _ => 3,
    }
}
