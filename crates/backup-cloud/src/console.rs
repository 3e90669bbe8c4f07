use async_trait::async_trait;
use backup_cloud_core::{Authorizer, StorageError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Interactive authorization on the terminal: instructions go to stderr,
/// the code is read as one line from stdin.
pub struct ConsoleAuthorizer;

#[async_trait]
impl Authorizer for ConsoleAuthorizer {
    async fn prompt(&self, message: &str) -> Result<String, StorageError> {
        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(format!("{} ", message).as_bytes())
            .await?;
        stderr.flush().await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await? {
            Some(line) => Ok(line.trim().to_string()),
            None => Err(StorageError::Authorization(
                "Standard input closed before an authorization code was entered".into(),
            )),
        }
    }
}
