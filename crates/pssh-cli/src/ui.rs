//! Terminal presentation: progress bar, colorized summary, and the
//! test-gate confirmation prompt (§10.5). None of this lives in
//! `pssh-manager` — it only depends on the `Reporter` trait seam.

use std::io::{self, IsTerminal, Write};

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use pssh_manager::{Reporter, Tally};
use pssh_process::Task;

/// Renders an `indicatif` bar as tasks finish; falls back to silence when
/// stderr isn't a terminal or the progress flag is off. Also handles
/// "inline" output mode (§4.3 "Output aggregation"): buffered stdout/stderr
/// printed once, on completion, instead of streamed as it arrives.
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
    inline: bool,
}

impl ProgressReporter {
    pub fn new(total: usize, enabled: bool, inline: bool) -> Self {
        let bar = if enabled && io::stderr().is_terminal() && total > 0 {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}",
                )
                .expect("valid progress template"),
            );
            Some(bar)
        } else {
            None
        };
        Self { bar, inline }
    }
}

impl Reporter for ProgressReporter {
    fn task_done(&mut self, task: &Task) {
        if self.inline {
            print_buffered(task);
        }
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(task.host.display_name());
        }
    }

    fn batch_complete(&mut self, tally: &Tally) {
        if let Some(bar) = &self.bar {
            bar.println(format!("batch complete: {} done", tally.total()));
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

fn print_buffered(task: &Task) {
    let host = task.host.display_name();
    let stdout = task.stdout_buffer();
    let stderr = task.stderr_buffer();
    if !stdout.is_empty() {
        for line in String::from_utf8_lossy(&stdout).lines() {
            println!("[{host}:stdout] {line}");
        }
    }
    if !stderr.is_empty() {
        for line in String::from_utf8_lossy(&stderr).lines() {
            eprintln!("[{host}:stderr] {line}");
        }
    }
}

/// Prints the end-of-run tally in the format described by §4.7's summary
/// rule: one colorized line per non-empty bucket plus a totals line.
pub fn print_summary(tally: &Tally) {
    let mut stderr = io::stderr();
    if !tally.succeeded.is_empty() {
        let _ = writeln!(
            stderr,
            "{} {}",
            "succeeded:".green().bold(),
            tally.succeeded.len()
        );
    }
    if !tally.ssh_failed.is_empty() {
        let _ = writeln!(
            stderr,
            "{} {}",
            "ssh failed:".yellow().bold(),
            tally.ssh_failed.len()
        );
        for host in &tally.ssh_failed {
            let _ = writeln!(stderr, "  {}", host.display_name().yellow());
        }
    }
    if !tally.cmd_failed.is_empty() {
        let _ = writeln!(
            stderr,
            "{} {}",
            "command failed:".red().bold(),
            tally.cmd_failed.len()
        );
        for host in &tally.cmd_failed {
            let _ = writeln!(stderr, "  {}", host.display_name().red());
        }
    }
    if !tally.killed.is_empty() {
        let _ = writeln!(
            stderr,
            "{} {}",
            "killed:".red().bold(),
            tally.killed.len()
        );
        for host in &tally.killed {
            let _ = writeln!(stderr, "  {}", host.display_name().red());
        }
    }
    let _ = writeln!(stderr, "total: {}", tally.total());
}

/// The test-gate's interactive "OK to continue? [y/N]" prompt (§4.6).
/// Defaults to "no" on EOF or a read error, mirroring a cautious default.
pub fn confirm_continue() -> bool {
    let mut stderr = io::stderr();
    let _ = write!(stderr, "Run the remaining hosts? [y/N] ");
    let _ = stderr.flush();

    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) => false,
        Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}
