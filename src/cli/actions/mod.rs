pub mod daemon;

mod run;

#[derive(Debug)]
pub enum Action {
    Daemon(daemon::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
