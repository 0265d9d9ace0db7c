//! Agreement identifier assignment on top of the shared sequence allocator.

use tracing::{info, instrument};

use leasebook_agreements::{AgreementIdentifier, AgreementIdentifierScope};

use crate::sequence::{SequenceAllocator, SequenceError};

/// Running numbers inside an identifier scope start here.
pub const FIRST_AGREEMENT_SEQUENCE: i64 = 1;

/// Allocate the next identifier in `scope`, e.g. `MA122-1`, then `MA122-2`.
///
/// Each (type, municipality, district) triple has its own counter, so
/// concurrent callers in one scope never receive the same identifier.
#[instrument(skip(allocator), fields(sequence = %scope.sequence_name()), err)]
pub async fn assign_agreement_identifier<A>(
    allocator: &A,
    scope: &AgreementIdentifierScope,
) -> Result<AgreementIdentifier, SequenceError>
where
    A: SequenceAllocator + ?Sized,
{
    let sequence = allocator
        .next_value(&scope.sequence_name(), FIRST_AGREEMENT_SEQUENCE)
        .await?;

    let identifier = scope
        .identifier(sequence)
        .map_err(|e| SequenceError::AllocationFailed(e.to_string()))?;

    info!(%identifier, "agreement identifier assigned");
    Ok(identifier)
}
