//! Log entry validation: signature verification and structural checks.
//!
//! These checks need no context beyond the entry itself. Parent presence and
//! lineage membership are the logbook's job.

use crate::entry::{LogEntry, OpPayload, OpType, ENTRY_VERSION};
use crate::error::ValidationError;
use crate::types::DatasetId;

/// Validate an entry's structure and signature.
///
/// This performs:
/// - Version check
/// - Payload hash verification
/// - Payload decoding for the declared op
/// - Parent rules (`Init` has none, everything else has one)
/// - Dataset id derivation for `Init`
/// - Signature verification
pub fn validate_entry(entry: &LogEntry) -> Result<(), ValidationError> {
    validate_entry_structure(entry)?;

    entry
        .header
        .author
        .verify(&entry.signing_message(), &entry.signature)
        .map_err(|_| ValidationError::SignatureFailed)?;

    Ok(())
}

/// Validate entry structure without signature verification.
///
/// Used when reading back from trusted local storage.
pub fn validate_entry_structure(entry: &LogEntry) -> Result<(), ValidationError> {
    let header = &entry.header;

    if header.version != ENTRY_VERSION {
        return Err(ValidationError::UnsupportedVersion(header.version));
    }

    if *blake3::hash(&entry.payload).as_bytes() != header.payload_hash {
        return Err(ValidationError::PayloadHashMismatch);
    }

    let payload = entry.decode_payload()?;

    match (header.op, header.parent) {
        (OpType::Init, Some(_)) => return Err(ValidationError::InitWithParent),
        (OpType::Init, None) => {}
        (op, None) => return Err(ValidationError::MissingParent(op)),
        (_, Some(_)) => {}
    }

    if let OpPayload::Init { username, name } = &payload {
        let expected = DatasetId::derive(&header.author, username, name, header.timestamp);
        if expected != header.dataset {
            return Err(ValidationError::DatasetIdMismatch);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keypair, Signature};
    use crate::entry::EntryBuilder;
    use crate::types::{BlockId, EntryId};

    fn make_test_keypair() -> Keypair {
        Keypair::from_seed(&[0x42; 32])
    }

    #[test]
    fn test_valid_init_and_commit() {
        let kp = make_test_keypair();
        let init = EntryBuilder::init("alice", "cities")
            .timestamp(1736870400000)
            .sign(&kp);
        assert!(validate_entry(&init).is_ok());

        let commit = EntryBuilder::commit(init.dataset(), init.compute_id(), BlockId::of(b"v1"), "v1")
            .timestamp(1736870400001)
            .sign(&kp);
        assert!(validate_entry(&commit).is_ok());
    }

    #[test]
    fn test_invalid_signature() {
        let kp = make_test_keypair();
        let mut entry = EntryBuilder::init("alice", "cities").sign(&kp);
        entry.signature = Signature::ZERO;

        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::SignatureFailed)
        ));
        // structure alone still passes
        assert!(validate_entry_structure(&entry).is_ok());
    }

    #[test]
    fn test_payload_hash_mismatch() {
        let kp = make_test_keypair();
        let mut entry = EntryBuilder::init("alice", "cities").sign(&kp);
        entry.payload = bytes::Bytes::from_static(b"\xa0");

        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::PayloadHashMismatch)
        ));
    }

    #[test]
    fn test_init_with_parent() {
        let kp = make_test_keypair();
        let entry = EntryBuilder::init("alice", "cities")
            .parent(Some(EntryId::from_bytes([1; 32])))
            .sign(&kp);

        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::InitWithParent)
        ));
    }

    #[test]
    fn test_commit_without_parent() {
        let kp = make_test_keypair();
        let init = EntryBuilder::init("alice", "cities").sign(&kp);
        let entry = EntryBuilder::commit(init.dataset(), init.compute_id(), BlockId::of(b"v1"), "")
            .parent(None)
            .sign(&kp);

        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::MissingParent(OpType::Commit))
        ));
    }

    #[test]
    fn test_init_dataset_mismatch() {
        let kp = make_test_keypair();
        let entry = EntryBuilder::init("alice", "cities")
            .dataset(DatasetId::from_bytes([9; 32]))
            .sign(&kp);

        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::DatasetIdMismatch)
        ));
    }
}
