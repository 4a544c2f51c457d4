use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};

use autoland_core::classifier::{self, ClassifierOptions};
use autoland_core::config::Config;
use autoland_core::orchestrator;
use autoland_core::pusher;
use autoland_core::report::{FileReporter, Reporter};
use autoland_core::services::Services;

#[derive(Parser, Debug)]
#[command(name = "autoland", version)]
#[command(about = "Automated landing pipeline: orchestrator, pusher, and outcome classifier")]
struct Cli {
    /// Configuration file (repeatable; later files override earlier ones).
    #[arg(long = "config-file", short = 'c', global = true)]
    config_files: Vec<PathBuf>,

    /// Verbose output.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the tracker for landing requests and aggregate results.
    Orchestrator {
        /// Drain this process's bus queue and exit.
        #[arg(long)]
        purge_queue: bool,
    },
    /// Consume apply jobs and push patch queues.
    Pusher {
        /// Drain this process's bus queue and exit.
        #[arg(long)]
        purge_queue: bool,
    },
    /// Classify downstream build outcomes for pushed revisions.
    Classifier {
        /// Branch to poll.
        #[arg(long, short = 'b')]
        branch: Option<String>,

        /// Poll a single revision instead of a time range.
        #[arg(long, short = 'r')]
        revision: Option<String>,

        /// Unix timestamp to start polling from.
        #[arg(long, short = 's')]
        start_time: Option<i64>,

        /// Unix timestamp to poll until.
        #[arg(long, short = 'e')]
        end_time: Option<i64>,

        /// Working directory for tracking incomplete revisions.
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Don't send completion messages to the bus.
        #[arg(long = "no-messages")]
        no_messages: bool,

        /// Only treat pushes carrying --post-to-bugzilla as try pushes.
        #[arg(long)]
        flag_check: bool,

        /// Don't post to the tracker, retrigger builds, or touch the cache.
        #[arg(long, short = 'n')]
        dry_run: bool,

        /// Log to this file instead of stderr.
        #[arg(long, short = 'l')]
        log_file: Option<PathBuf>,

        /// Drain the result queue this process feeds and exit.
        #[arg(long)]
        purge_queue: bool,
    },
}

struct CliReporter {
    verbose: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if self.verbose {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config_files)?;

    match cli.cmd {
        Commands::Orchestrator { purge_queue } => {
            let services = Services::from_config(config)?;
            if purge_queue {
                return purge_with_confirmation(
                    &services.config.bus.orchestrator_queue.clone(),
                    || orchestrator::purge_queue(&services),
                    orchestrator::queue_depth(&services)?,
                );
            }
            let mut reporter = CliReporter {
                verbose: cli.verbose,
            };
            orchestrator::run(&services, &mut reporter)
        }
        Commands::Pusher { purge_queue } => {
            let services = Services::from_config(config)?;
            if purge_queue {
                return purge_with_confirmation(
                    &services.config.bus.pusher_queue.clone(),
                    || pusher::purge_queue(&services),
                    pusher::queue_depth(&services)?,
                );
            }
            let mut reporter = CliReporter {
                verbose: cli.verbose,
            };
            pusher::run(&services, &mut reporter)
        }
        Commands::Classifier {
            branch,
            revision,
            start_time,
            end_time,
            cache_dir,
            no_messages,
            flag_check,
            dry_run,
            log_file,
            purge_queue,
        } => {
            let services = Services::from_config(config)?;
            if purge_queue {
                // the classifier only feeds the result queue; purging
                // drains what it has published
                return purge_with_confirmation(
                    &services.config.bus.orchestrator_queue.clone(),
                    || orchestrator::purge_queue(&services),
                    orchestrator::queue_depth(&services)?,
                );
            }

            let mut opts = ClassifierOptions::from_config(&services.config.classifier);
            if let Some(branch) = branch {
                opts.branch = branch;
            }
            if let Some(cache_dir) = cache_dir {
                opts.cache_dir = cache_dir;
            }
            opts.messages = !no_messages;
            opts.flag_check = flag_check;
            opts.dry_run = dry_run;

            let start = start_time.map(parse_unix_time).transpose()?;
            let end = end_time.map(parse_unix_time).transpose()?;

            let mut file_reporter;
            let mut cli_reporter;
            let reporter: &mut dyn Reporter = match log_file {
                Some(path) => {
                    file_reporter = FileReporter::open(&path)?;
                    &mut file_reporter
                }
                None => {
                    cli_reporter = CliReporter {
                        verbose: cli.verbose,
                    };
                    &mut cli_reporter
                }
            };

            classifier::run_once(&services, &opts, revision.as_deref(), start, end, reporter)
        }
    }
}

fn parse_unix_time(seconds: i64) -> Result<DateTime<Utc>> {
    match Utc.timestamp_opt(seconds, 0) {
        chrono::LocalResult::Single(t) => Ok(t),
        _ => bail!("invalid unix timestamp: {seconds}"),
    }
}

fn purge_with_confirmation(
    queue: &str,
    purge: impl FnOnce() -> Result<usize>,
    depth: usize,
) -> Result<()> {
    println!("Warning: queue {queue} contains {depth} message(s).");
    if !confirm("Are you sure you'd like to purge the queue? [y/n] ")? {
        return Ok(());
    }
    let purged = purge()?;
    println!("Purged {purged} message(s) from {queue}");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    let stdin = io::stdin();
    loop {
        print!("{prompt}");
        io::stdout().flush().context("flushing stdout")?;
        let mut answer = String::new();
        if stdin
            .lock()
            .read_line(&mut answer)
            .context("reading confirmation")?
            == 0
        {
            // EOF means no
            return Ok(false);
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_classifier_flags() {
        let cli = Cli::try_parse_from([
            "autoland",
            "classifier",
            "--branch",
            "central",
            "--revision",
            "8dc05498d708",
            "--start-time",
            "1370888572",
            "--end-time",
            "1370903000",
            "--cache-dir",
            "/tmp/cache",
            "--no-messages",
            "--flag-check",
            "--dry-run",
            "--config-file",
            "a.toml",
            "--config-file",
            "b.toml",
        ])
        .expect("parse");

        assert_eq!(cli.config_files.len(), 2);
        match cli.cmd {
            Commands::Classifier {
                branch,
                revision,
                start_time,
                no_messages,
                flag_check,
                dry_run,
                ..
            } => {
                assert_eq!(branch.as_deref(), Some("central"));
                assert_eq!(revision.as_deref(), Some("8dc05498d708"));
                assert_eq!(start_time, Some(1370888572));
                assert!(no_messages);
                assert!(flag_check);
                assert!(dry_run);
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_purge_queue() {
        let cli =
            Cli::try_parse_from(["autoland", "pusher", "--purge-queue"]).expect("parse");
        match cli.cmd {
            Commands::Pusher { purge_queue } => assert!(purge_queue),
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn parse_unix_time_round_trips() {
        let t = parse_unix_time(1370888572).expect("parse");
        assert_eq!(t.timestamp(), 1370888572);
    }
}
