use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::browser::{BrowserError, BrowserResult};

/// Where the engine hands control to a human, e.g. to solve a login challenge
/// in the visible browser window.
#[async_trait]
pub trait OperatorGate: Send + Sync {
    /// Resolves once the operator reports the page is ready to continue.
    async fn await_operator(&self, message: &str) -> BrowserResult<()>;
}

/// Prints a banner and waits for ENTER on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOperatorGate;

#[async_trait]
impl OperatorGate for ConsoleOperatorGate {
    async fn await_operator(&self, message: &str) -> BrowserResult<()> {
        warn!(message, "manual intervention required");
        eprintln!("############################################");
        eprintln!("# {message}");
        eprintln!("# Press ENTER when done.");
        eprintln!("############################################");
        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Err(BrowserError::ManualIntervention(
                "stdin closed while waiting for the operator".into(),
            ));
        }
        Ok(())
    }
}

/// For unattended runs: any request for a human fails immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnattendedOperatorGate;

#[async_trait]
impl OperatorGate for UnattendedOperatorGate {
    async fn await_operator(&self, message: &str) -> BrowserResult<()> {
        Err(BrowserError::ManualIntervention(format!(
            "{message} (no operator attached)"
        )))
    }
}
