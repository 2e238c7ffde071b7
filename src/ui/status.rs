use dialoguer::console::style;

pub enum CommandStatus {
    Success,
    Error,
    Warning,
}

pub fn status_line(status: &CommandStatus, message: &str) -> String {
    let indicator = match status {
        CommandStatus::Success => style("✓").green(),
        CommandStatus::Error => style("✗").red(),
        CommandStatus::Warning => style("!").yellow(),
    };
    format!("{indicator} {message}")
}

pub fn print_command_status(status: CommandStatus, message: &str) {
    eprintln!("{}", status_line(&status, message));
}
