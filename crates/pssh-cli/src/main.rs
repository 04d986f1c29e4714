use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use pssh_config::{Cli, PsshConfig};
use pssh_hosts::{HostResolveOptions, ServerPool};
use pssh_manager::{Manager, SshClassifier};
use pssh_process::Task;
use std::process::ExitCode;

mod argv;
mod export;
mod ui;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // `--verbose` raises the default log level when RUST_LOG isn't set,
    // rather than overriding an operator's explicit filter (§10.3).
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init()
        .ok();

    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("pssh: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = PsshConfig::load(cli).context("failed to resolve configuration")?;

    export::validate_output_dir(&config.manager.outdir)?;
    export::validate_output_dir(&config.manager.errdir)?;
    let export_path = export::resolve_export_path(config.export.clone())?;

    let host_opts = HostResolveOptions {
        host_files: config.host_files.clone(),
        host_strings: config.hosts.clone(),
        default_user: config.user.clone(),
        host_regexp: config.host_filter.clone(),
        sample_size: config.limit,
    };
    let pool = ServerPool::resolve(&host_opts).context("failed to resolve host pool")?;
    if pool.is_empty() {
        anyhow::bail!("no hosts to run against");
    }

    let askpass_helper = if config.manager.askpass {
        Some(
            which::which("pssh-askpass-helper")
                .context("askpass requested but pssh-askpass-helper is not on PATH")?,
        )
    } else {
        None
    };

    let mut manager = Manager::new(
        config.manager.clone(),
        Rc::new(SshClassifier),
        askpass_helper,
        export_path,
    );

    let task_opts = config.manager.task_options();
    for host in pool.into_hosts() {
        let full_argv = argv::ssh_argv(&host, &config.command);
        let task = Task::new(host, full_argv, None, task_opts.clone());
        manager.add_task(task);
    }

    let mut reporter = ui::ProgressReporter::new(
        manager.pending_count(),
        config.manager.progress_bar,
        config.manager.inline,
    );
    let mut confirm = ui::confirm_continue;
    let outcome = manager.run(&mut reporter, &mut confirm)?;

    if config.manager.summary {
        drop(reporter);
        ui::print_summary(&outcome.tally);
    }

    Ok(outcome.process_exit_code())
}
