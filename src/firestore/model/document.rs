use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known about the document.
    Invalid,
    FoundDocument,
    NoDocument,
    /// The document exists on the server but its contents are unknown locally,
    /// e.g. after a patch was acknowledged for a document that was never cached.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// Mutable document state shared by the remote cache, overlays and views.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_found(version, data);
        document
    }

    pub fn new_found_with_create_time(
        key: DocumentKey,
        version: SnapshotVersion,
        create_time: SnapshotVersion,
        data: MapValue,
    ) -> Self {
        let mut document = Self::new_found(key, version, data);
        document.create_time = create_time;
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_unknown(version);
        document
    }

    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Local mutations reset the version: the result is not a server state.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    /// True while the document reflects writes the server has not acknowledged.
    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn found_document_records_create_time() {
        let doc = Document::new_found(key(), version(5), MapValue::empty());
        assert!(doc.is_found_document());
        assert_eq!(doc.create_time(), version(5));
        assert_eq!(doc.state(), DocumentState::Synced);
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc = Document::new_found(key(), version(5), MapValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.has_pending_writes());
        assert!(doc.version().is_min());
    }

    #[test]
    fn unknown_documents_carry_committed_state() {
        let doc = Document::new_unknown(key(), version(2));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
        assert!(!doc.has_pending_writes());
    }
}
