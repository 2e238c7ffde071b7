use std::io::IsTerminal;

use dialoguer::Confirm;
use tracing::debug;

use super::{print_command_status, CommandStatus};

pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

/// Ask whether to open `url` in the browser. Off a terminal this does
/// nothing; the caller has already printed the URL.
pub fn offer_to_open(url: &str) {
    if !is_interactive() {
        return;
    }
    let confirmed = Confirm::new()
        .with_prompt("Open the authorization page in your browser?")
        .default(true)
        .interact();
    match confirmed {
        Ok(true) => match open::that(url) {
            Ok(()) => print_command_status(CommandStatus::Success, &format!("Opened {url}")),
            Err(e) => print_command_status(
                CommandStatus::Warning,
                &format!("failed to open browser: {e}"),
            ),
        },
        Ok(false) => {}
        Err(e) => debug!(error = %e, "confirm prompt failed"),
    }
}
