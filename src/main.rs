use std::{
    io::Write,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use doccat::{
    Action,
    CatalogConfig,
    DataDir,
    IndexKey,
    QueueDb,
    error::{self, Error},
    index::ActionMode,
    processor::{BasicActionProcessor, ProcessOptions},
    queue_db::ActionsQueue,
    txn::{ActionProcessor, ActionTarget, commit_with_tries},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, DrainArgs, QueueAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCCAT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Queue(args) => {
            let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
            let db = QueueDb::open(&data_dir.queue_db())?;
            let processor =
                BasicActionProcessor::new(&db).with_queue_name(&args.queue);
            match args.action {
                QueueAction::Show { json } => {
                    queue_show(&processor, json)?;
                }
                QueueAction::Engage => {
                    processor.engage()?;
                    println!("Engaged queue '{}'", args.queue);
                }
                QueueAction::Disengage => {
                    let leftover = processor.disengage()?;
                    print_actions(&leftover)?;
                    println!(
                        "Disengaged queue '{}' ({} action(s) left)",
                        args.queue,
                        leftover.len()
                    );
                }
                QueueAction::Push {
                    catalog,
                    index,
                    oid,
                    kind,
                } => {
                    queue_push(&processor, &catalog, &index, oid, &kind)?;
                }
                QueueAction::Drain(drain) => {
                    queue_drain(processor, &drain)?;
                }
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Check { files, system } => {
                let files = if files.is_empty() {
                    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
                    default_declarations(&data_dir)
                } else {
                    files
                };
                config_check(&files, system)?;
            }
        },
    }

    Ok(())
}

fn queue_show(
    processor: &BasicActionProcessor,
    json: bool,
) -> error::Result<()> {
    let queue = processor.get_queue()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&queue)?);
        return Ok(());
    }
    let Some(ActionsQueue {
        generation,
        actions,
        active,
    }) = queue
    else {
        println!("Queue '{}' is not engaged.", processor.queue_name());
        return Ok(());
    };
    println!(
        "{}\tgeneration {generation}\t{}\t{} action(s)",
        processor.queue_name(),
        if active { "active" } else { "inactive" },
        actions.len()
    );
    for action in &actions {
        println!("  {action}");
    }
    Ok(())
}

fn queue_push(
    processor: &BasicActionProcessor,
    catalog: &str,
    index: &str,
    oid: i64,
    kind: &str,
) -> error::Result<()> {
    let key = IndexKey::new(catalog, index);
    let action = match kind {
        "add" => Action::add(key, oid, ActionMode::Deferred, None),
        "change" => Action::change(key, oid, ActionMode::Deferred, None),
        _ => Action::remove(key, oid, ActionMode::Deferred),
    };
    let conn = processor.connection();
    commit_with_tries(conn, 3, || processor.add(vec![action.clone()]))?;
    println!("Queued {action}");
    Ok(())
}

/// Writes each action it is handed to stdout as one JSON object per line.
struct JsonLines<W: Write> {
    out: W,
}

impl<W: Write> ActionTarget for JsonLines<W> {
    fn execute(&mut self, action: &Action) -> error::Result<()> {
        let line = serde_json::to_string(action)?;
        writeln!(self.out, "{line}")?;
        Ok(())
    }
}

fn print_actions(actions: &[Action]) -> error::Result<()> {
    let mut target = JsonLines {
        out: std::io::stdout().lock(),
    };
    for action in actions {
        target.execute(action)?;
    }
    Ok(())
}

fn queue_drain(
    processor: BasicActionProcessor,
    args: &DrainArgs,
) -> error::Result<()> {
    processor.engage()?;
    let options = ProcessOptions {
        sleep: Duration::from_secs(args.sleep),
        once: !args.follow,
    };

    if !args.follow {
        let stop = AtomicBool::new(false);
        let mut target = JsonLines {
            out: std::io::stdout(),
        };
        let stats = processor.process(&mut target, &options, &stop)?;
        info!(?stats, "drained");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let mut worker = tokio::task::spawn_blocking(move || {
            let mut target = JsonLines {
                out: std::io::stdout(),
            };
            processor.process(&mut target, &options, &worker_stop)
        });

        let joined = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("interrupted, finishing current batch");
                stop.store(true, Ordering::SeqCst);
                worker.await
            }
            joined = &mut worker => joined,
        };

        let stats = joined.map_err(|e| {
            Error::Config(format!("queue worker panicked: {e}"))
        })??;
        info!(?stats, "drained");
        Ok::<_, Error>(())
    })
}

/// The data directory's `catalogs.json`, when there is one.
fn default_declarations(data_dir: &DataDir) -> Vec<PathBuf> {
    let path = data_dir.catalogs_config();
    if path.is_file() {
        info!(path = %path.display(), "using default declarations");
        vec![path]
    } else {
        Vec::new()
    }
}

fn config_check(
    files: &[PathBuf],
    system: bool,
) -> error::Result<()> {
    let mut config = if system {
        CatalogConfig::new().with_system_catalog()?
    } else {
        CatalogConfig::new()
    };
    for file in files {
        let json = std::fs::read_to_string(file)?;
        config.extend_from_json(&json).map_err(|e| {
            Error::Config(format!("{}: {e}", file.display()))
        })?;
    }
    println!("{}", config.to_json()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use doccat::txn::Transaction;

    use super::*;

    #[test]
    fn json_lines_writes_one_object_per_action() {
        let mut target = JsonLines { out: Vec::new() };
        let key = IndexKey::new("system", "name");
        target
            .execute(&Action::add(key.clone(), 1, ActionMode::Deferred, None))
            .unwrap();
        target
            .execute(&Action::remove(key, 2, ActionMode::Deferred))
            .unwrap();
        let text = String::from_utf8(target.out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "add");
        assert_eq!(first["oid"], 1);
    }

    #[test]
    fn config_check_falls_back_to_the_data_dir_declarations() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        assert!(default_declarations(&data_dir).is_empty());

        std::fs::write(data_dir.catalogs_config(), "{}").unwrap();
        let files = default_declarations(&data_dir);
        assert_eq!(files, vec![tmp.path().join("catalogs.json")]);
        config_check(&files, true).unwrap();
    }

    #[test]
    fn push_then_drain_round_trips_through_the_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let db = QueueDb::open(&tmp.path().join("queue.redb")).unwrap();
        let processor = BasicActionProcessor::new(&db);
        processor.engage().unwrap();
        queue_push(&processor, "system", "name", 4, "change").unwrap();
        assert_eq!(processor.get_queue().unwrap().unwrap().len(), 1);

        let mut target = JsonLines { out: Vec::new() };
        let stop = AtomicBool::new(false);
        let options = ProcessOptions {
            sleep: Duration::ZERO,
            once: true,
        };
        let stats = processor.process(&mut target, &options, &stop).unwrap();
        assert_eq!(stats.executed, 1);
        assert!(processor.connection().sync().is_ok());
        assert!(!processor.active().unwrap());
    }
}
