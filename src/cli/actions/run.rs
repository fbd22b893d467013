use crate::cli::actions::{Action, daemon};
use anyhow::Result;

/// Single dispatch point for CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Daemon(args) => daemon::execute(args).await,
    }
}
