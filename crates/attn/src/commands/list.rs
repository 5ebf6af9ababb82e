use attn_paths::AttnPaths;
use attn_protocol::client::send_to_daemon;
use attn_protocol::hook::HookMessage;
use attn_protocol::types::SessionSnapshot;
use clap::ArgMatches;

pub(crate) fn handle_list(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let paths = AttnPaths::resolve()?;
    let config = attn_core::load_daemon_config(&paths)?;
    let socket = config.socket_path(&paths);

    let sessions = match send_to_daemon(&socket, &HookMessage::List) {
        Ok(reply) => reply.sessions.unwrap_or_default(),
        Err(attn_protocol::IpcError::NotRunning { .. }) => {
            println!("Daemon is not running");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    print_table(&sessions);
    Ok(())
}

fn print_table(sessions: &[SessionSnapshot]) {
    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .chain(["SESSION".len()].into_iter())
        .max()
        .unwrap_or(7);
    let label_width = sessions
        .iter()
        .map(|s| s.label.len())
        .chain(["LABEL".len()].into_iter())
        .max()
        .unwrap_or(5);

    println!(
        "{:<id_width$}  {:<label_width$}  {:<8}  {:<16}  CWD",
        "SESSION", "LABEL", "AGENT", "STATE",
    );
    for session in sessions {
        println!(
            "{:<id_width$}  {:<label_width$}  {:<8}  {:<16}  {}",
            &*session.id,
            session.label,
            session.agent.as_str(),
            session.state.as_str(),
            session.cwd,
        );
    }
}
