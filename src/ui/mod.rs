mod progress;
mod prompt;
mod status;

pub use progress::Progress;
pub use prompt::offer_to_open;
pub use status::{print_command_status, CommandStatus};
