use attn_core::init_cli_logging;

mod app;
mod commands;

fn main() {
    let app = app::build_cli();
    let matches = app.get_matches();

    let verbose = matches.get_flag("verbose");
    let foreground_daemon = matches
        .subcommand_matches("daemon")
        .and_then(|d| d.subcommand_matches("start"))
        .is_some_and(|s| s.get_flag("foreground"));
    match matches.subcommand() {
        // The worker's stderr is already the per-session log file.
        Some(("pty-worker", _)) => init_cli_logging(false),
        // The foreground daemon installs its JSON file subscriber itself.
        _ if foreground_daemon => {}
        _ => init_cli_logging(!verbose),
    }

    if let Err(e) = commands::run_command(&matches) {
        eprintln!("attn: {e}");
        std::process::exit(1);
    }
}
