use anyhow::Result;
use spicepack::cli::{actions, actions::Action, start};
use std::process::exit;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // one line at the default level; the full cause chain only shows
        // under -v and above
        log::error!("{err}");
        log::debug!("{err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let action = start()?;

    match action {
        Action::Seal { .. } => {
            actions::seal::handle(action).await?;
        }
    }

    Ok(())
}
