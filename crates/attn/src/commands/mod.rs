mod daemon;
mod hooks;
mod list;

use clap::ArgMatches;

pub fn run_command(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        Some(("daemon", sub)) => daemon::handle_daemon_command(sub),
        Some(("list", sub)) => list::handle_list(sub),
        Some(("pty-worker", _)) => {
            attn_daemon::run_worker_from_stdin()?;
            Ok(())
        }
        Some(("_hook-stop", sub)) => hooks::handle_hook_stop(sub),
        Some(("_hook-state", sub)) => hooks::handle_hook_state(sub),
        Some(("_hook-todo", sub)) => hooks::handle_hook_todo(sub),
        _ => Err("unknown subcommand".into()),
    }
}
