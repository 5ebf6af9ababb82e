use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("attn")
        .about("Local control-plane for interactive AI coding agent sessions")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("daemon")
                .about("Manage the attn daemon")
                .subcommand_required(true)
                .subcommand(
                    Command::new("start").about("Start the daemon").arg(
                        Arg::new("foreground")
                            .long("foreground")
                            .action(ArgAction::SetTrue)
                            .help("Run in the foreground instead of detaching"),
                    ),
                )
                .subcommand(Command::new("stop").about("Stop the running daemon"))
                .subcommand(Command::new("status").about("Show daemon status")),
        )
        .subcommand(
            Command::new("list").about("List sessions").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Output as JSON"),
            ),
        )
        .subcommand(
            // Spawned by the daemon; reads its spawn spec from stdin.
            Command::new("pty-worker")
                .about("Run a PTY worker (internal)")
                .hide(true),
        )
        .subcommand(
            Command::new("_hook-stop")
                .hide(true)
                .arg(Arg::new("session-id").required(true)),
        )
        .subcommand(
            Command::new("_hook-state")
                .hide(true)
                .arg(Arg::new("session-id").required(true))
                .arg(Arg::new("state").required(true)),
        )
        .subcommand(
            Command::new("_hook-todo")
                .hide(true)
                .arg(Arg::new("session-id").required(true)),
        )
}
