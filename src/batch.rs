use serde::Serialize;

use crate::config::Job;
use crate::error::{FtpError, FtpResult};
use crate::ftp::{DirEntry, Operation, OperationOutput, Session, SessionState, TransferDescriptor};
use crate::logging::log_with_thread;
use crate::shutdown::is_shutdown_requested;

/// Result of one invocation item, serialised untagged
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ItemResult {
    /// `list`
    Entries(Vec<DirEntry>),
    /// `download` / `upload`
    Transfer(TransferDescriptor),
    /// `delete` / `mkdir` / `rmdir`
    Success { success: bool },
    /// A failed item when continue-on-fail is set
    Error { error: String },
}

impl From<OperationOutput> for ItemResult {
    fn from(output: OperationOutput) -> Self {
        match output {
            OperationOutput::Entries(entries) => ItemResult::Entries(entries),
            OperationOutput::Transfer(desc) => ItemResult::Transfer(desc),
            OperationOutput::Done => ItemResult::Success { success: true },
        }
    }
}

/// One line of the results output
#[derive(Debug, Serialize)]
pub struct JobReport {
    pub job: usize,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ItemResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn new(job: usize, host: String, outcome: FtpResult<Vec<ItemResult>>) -> Self {
        match outcome {
            Ok(results) => JobReport {
                job,
                host,
                results: Some(results),
                error: None,
            },
            Err(e) => JobReport {
                job,
                host,
                results: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs every item of a job on one session
///
/// # Arguments
/// * `job` - Connection settings and the items to run
/// * `continue_on_fail_default` - Used when the job does not set `continue_on_fail`
/// * `thread_id` - Identifier for logging in parallel mode
///
/// # Returns
/// One `ItemResult` per item, in order
///
/// # Errors
/// - The connection or login fails (even with continue-on-fail)
/// - An item fails and continue-on-fail is off
/// - Shutdown was requested
///
/// # Behavior
/// - The session is closed on every path
/// - With continue-on-fail, a session whose control channel was lost is
///   reconnected before the next item. A failed reconnect is recorded as
///   that item's error and retried on the item after it
pub fn run_job(job: Job, continue_on_fail_default: bool, thread_id: usize) -> FtpResult<Vec<ItemResult>> {
    let Job {
        connection,
        continue_on_fail,
        items,
    } = job;
    let continue_on_fail = continue_on_fail.unwrap_or(continue_on_fail_default);

    if is_shutdown_requested() {
        let _ = log_with_thread("Shutdown requested, skipping job", Some(thread_id));
        return Err(FtpError::Cancelled);
    }

    let _ = log_with_thread(
        format!(
            "Running {} item(s) on ftp://{}@{}:{}",
            items.len(),
            connection.user,
            connection.host,
            connection.resolved_port()
        ),
        Some(thread_id),
    );

    let mut session = scopeguard::guard(Session::new(connection), |mut session| session.close());
    session.connect()?;

    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if is_shutdown_requested() {
            let _ = log_with_thread("Shutdown requested, stopping job", Some(thread_id));
            return Err(FtpError::Cancelled);
        }

        let outcome = reconnect_if_lost(&mut session, index, thread_id)
            .and_then(|_| Operation::from_invocation(item))
            .and_then(|op| session.execute(&op));
        match outcome {
            Ok(output) => results.push(ItemResult::from(output)),
            Err(e) => {
                let _ = log_with_thread(
                    format!("Item {} ({}) failed: {}", index + 1, item.operation, e),
                    Some(thread_id),
                );
                if !continue_on_fail || matches!(e, FtpError::Cancelled) {
                    return Err(e);
                }
                results.push(ItemResult::Error {
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(results)
}

fn reconnect_if_lost(session: &mut Session, index: usize, thread_id: usize) -> FtpResult<()> {
    if session.state() != SessionState::Disconnected {
        return Ok(());
    }
    let _ = log_with_thread(
        format!(
            "Reconnecting session {} to {} before item {}",
            session.tag(),
            session.config().host,
            index + 1
        ),
        Some(thread_id),
    );
    session.connect()
}
