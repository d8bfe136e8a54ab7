use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pmon::{
    cli::{CYAN, Cli, Commands, DIM, GREEN, RED, RESET, YELLOW, gather_rows, render_ls_table},
    config::load_config,
    daemon::{EnterKeyEscape, ServiceManager, StopOptions},
    error::{LogsManagerError, SupervisorError},
    logs::{LogStream, TaggedLine},
    stats::probe_gpu_source,
};

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    // Diagnostics go to stderr so tables, JSON, and tailed logs stay clean
    // on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}

/// Dispatches a parsed invocation. `Ok(false)` means every requested
/// operation ran but at least one reported failure.
fn run(cli: Cli) -> Result<bool, SupervisorError> {
    let config = load_config(&cli.config)?;
    let manager = ServiceManager::new(config)?;

    match cli.command {
        Commands::Start { services, dry_run } => {
            let names = resolve_selection(&manager, &services)?;
            let mut all_ok = true;
            for name in &names {
                if dry_run {
                    println!("{}", manager.preview_command(name)?);
                } else {
                    all_ok &= manager.start_service(name, false)?;
                }
            }
            Ok(all_ok)
        }

        Commands::Stop { services } => {
            let names = resolve_selection(&manager, &services)?;
            let mut all_ok = true;
            for name in &names {
                all_ok &=
                    manager.stop_service_with(name, StopOptions::default(), &EnterKeyEscape)?;
            }
            Ok(all_ok)
        }

        Commands::Restart { services } => {
            let names = resolve_selection(&manager, &services)?;
            let mut all_ok = true;
            for name in &names {
                all_ok &= manager.restart_service(name)?;
            }
            Ok(all_ok)
        }

        Commands::Logs {
            services,
            no_follow,
            lines,
        } => {
            let names = resolve_selection(&manager, &services)?;
            let ordered = manager.service_names();
            let triples: Vec<(usize, String, bool)> = names
                .iter()
                .filter_map(|name| {
                    let id = ordered.iter().position(|n| n == name)?;
                    let merge = manager.config().get(name).map(|s| s.merge_logs)?;
                    Some((id, name.clone(), merge))
                })
                .collect();

            let targets = manager.logs().resolve_targets(&triples);
            if targets.is_empty() && !services.is_empty() {
                return Err(LogsManagerError::NoLogFiles(names.join(", ")).into());
            }

            let mut sink = |line: TaggedLine| print_tagged(&line);
            manager.logs().print_recent(&targets, lines, &mut sink)?;

            if !no_follow && !targets.is_empty() {
                let running = Arc::new(AtomicBool::new(true));
                let handle = running.clone();
                let _ = ctrlc::set_handler(move || handle.store(false, Ordering::SeqCst));
                manager.logs().follow(&targets, &running, &mut sink)?;
            }
            Ok(true)
        }

        Commands::Flush { services } => {
            let names = resolve_selection(&manager, &services)?;
            let running = manager.running_services();
            let summary = manager.logs().flush_logs(&names, &running);

            for name in &names {
                if let Some((deleted, cleared)) = summary.per_service.get(name) {
                    info!(
                        "Flushed '{name}': {deleted} file(s) deleted, {cleared} file(s) cleared"
                    );
                }
            }
            Ok(true)
        }

        Commands::Ls { json } => {
            let gpu = probe_gpu_source();
            let rows = gather_rows(&manager, gpu.as_ref());

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows)
                        .unwrap_or_else(|_| "[]".to_string())
                );
            } else {
                print!("{}", render_ls_table(&rows));
            }
            Ok(true)
        }
    }
}

/// Resolves user-supplied service specs (names or numeric ids) against the
/// configuration. An empty selection or the literal `all` means every
/// configured service.
fn resolve_selection(
    manager: &ServiceManager,
    specs: &[String],
) -> Result<Vec<String>, SupervisorError> {
    if specs.is_empty() || specs.iter().any(|spec| spec == "all") {
        return Ok(manager.service_names());
    }

    specs
        .iter()
        .map(|spec| {
            manager
                .config()
                .resolve_name(spec)
                .ok_or_else(|| SupervisorError::UnknownService(spec.clone()))
        })
        .collect()
}

fn print_tagged(line: &TaggedLine) {
    let color = match line.stream {
        LogStream::Stdout => GREEN,
        LogStream::Stderr => RED,
        LogStream::Merged => YELLOW,
    };
    println!(
        "{DIM}{}{RESET} {CYAN}{}|{}{RESET} {color}{}{RESET} {}",
        line.timestamp,
        line.id,
        line.service,
        line.stream.as_ref(),
        line.message
    );
}
