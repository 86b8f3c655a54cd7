#![forbid(unsafe_code)]

use avatar_engines::identity::bearer_token_from_header;
use avatar_kernel_contracts::avatar::{AvatarRecordView, RecordId};
use avatar_storage::records::RecordStatusCounts;

use crate::context::AppContext;
use crate::pipeline::PipelineError;

/// Returns the caller's view of one record.
///
/// Unknown ids, malformed ids and records owned by someone else are all
/// reported as `NotFound` so a caller cannot probe for other users' records.
pub fn fetch_record(
    ctx: &AppContext,
    authorization: Option<&str>,
    record_id: &str,
) -> Result<AvatarRecordView, PipelineError> {
    let token = bearer_token_from_header(authorization)?;
    let caller = ctx.identity.verify(token)?;

    let record_id = RecordId::new(record_id).map_err(|_| PipelineError::NotFound)?;

    match ctx.records.get(&record_id)? {
        Some(record) if record.caller_user_id == caller.user_id => Ok(record.view()),
        Some(_) => {
            tracing::debug!(record_id = %record_id, "record lookup by non-owner");
            Err(PipelineError::NotFound)
        }
        None => Err(PipelineError::NotFound),
    }
}

pub fn status_counts(ctx: &AppContext) -> Result<RecordStatusCounts, PipelineError> {
    Ok(ctx.records.status_counts()?)
}
