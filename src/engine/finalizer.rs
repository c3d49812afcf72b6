use super::envelope::EnvelopeParser;
use super::snapshot::SnapshotReader;
use crate::config::Timings;
use std::time::Duration;
use tracing::{debug, warn};

/// Read the finished response and turn it into the final answer. Empty or
/// missing snapshots are retried with backoff; after the last attempt the
/// answer is the empty string.
pub async fn finalize(
    reader: &mut SnapshotReader,
    parser: &EnvelopeParser,
    timings: &Timings,
    req_id: &str,
) -> String {
    let attempts = timings.finalize_attempts.max(1);
    for attempt in 0..attempts {
        match reader.read_fresh().await {
            Some(raw) if !raw.trim().is_empty() => {
                debug!(
                    "[{}] Final snapshot read on attempt {} ({} chars)",
                    req_id,
                    attempt + 1,
                    raw.len()
                );
                return parser.final_answer(&raw);
            }
            _ => {
                warn!(
                    "[{}] Final snapshot empty (attempt {}/{})",
                    req_id,
                    attempt + 1,
                    attempts
                );
                if attempt + 1 < attempts {
                    let backoff =
                        timings.finalize_backoff() + Duration::from_millis(500 * attempt as u64);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    String::new()
}
