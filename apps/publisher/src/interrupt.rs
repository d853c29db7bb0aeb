//! Ctrl-C handling for interactive prompts.

use std::{future::Future, io::Write as _};

use anyhow::{Context, Result};
use tokio::signal;

/// Resolves on Ctrl-C. Never resolves when no handler can be installed.
pub async fn ctrl_c() {
    if signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs `work` unless `interrupt` resolves first, in which case `None` is returned
/// and `work` is dropped.
pub async fn until_interrupted<T>(
    work: impl Future<Output = Result<T>>,
    interrupt: impl Future<Output = ()>,
) -> Result<Option<T>> {
    tokio::select! {
        result = work => result.map(Some),
        () = interrupt => Ok(None),
    }
}

/// Reads one line from stdin. Returns `None` when Ctrl-C arrives first.
pub async fn prompt(message: &'static str) -> Result<Option<String>> {
    let read_line = async move {
        tokio::task::spawn_blocking(move || {
            print!("{message}");
            std::io::stdout().flush().context("failed to flush stdout")?;
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("failed to read from stdin")?;
            Ok::<_, anyhow::Error>(line.trim().to_string())
        })
        .await
        .context("prompt task panicked")?
    };

    let answer = until_interrupted(read_line, ctrl_c()).await?;
    if answer.is_none() {
        println!();
    }
    Ok(answer)
}

#[cfg(test)]
#[path = "tests/interrupt_tests.rs"]
mod tests;
