use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::connection::StreamKind;
use crate::firestore::remote::persistent_stream::{
    PersistentStream, StreamEvent, StreamIo, StreamTransition,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::util::hard_assert;

#[derive(Clone, Debug, PartialEq)]
pub enum WriteStreamEvent {
    Opened,
    HandshakeComplete,
    MutationResults {
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    },
    Closed(Option<FirestoreError>),
}

/// Write stream. The first response after opening completes the handshake and
/// carries the stream token every later write request must echo.
#[derive(Debug)]
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            stream: PersistentStream::new(StreamKind::Write),
            serializer,
            handshake_complete: false,
            last_stream_token: Vec::new(),
        }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn clear_stream_token(&mut self) {
        self.last_stream_token.clear();
    }

    pub fn start(&mut self, io: &dyn StreamIo) {
        self.handshake_complete = false;
        self.last_stream_token.clear();
        self.stream.start(io);
    }

    pub fn write_handshake(&mut self, io: &dyn StreamIo) {
        hard_assert(self.is_open(), "writing handshake requires an opened stream");
        hard_assert(!self.handshake_complete, "handshake already completed");
        let frame = json!({ "database": self.serializer.database_name() });
        self.stream.send(io, frame);
    }

    pub fn write_mutations(&mut self, io: &dyn StreamIo, mutations: &[Mutation]) {
        hard_assert(self.is_open(), "writing mutations requires an opened stream");
        hard_assert(self.handshake_complete, "handshake must be complete before writing mutations");
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let frame = json!({
            "streamToken": self.serializer.encode_bytes(&self.last_stream_token),
            "writes": writes,
        });
        self.stream.send(io, frame);
    }

    pub fn handle_event(&mut self, io: &dyn StreamIo, event: StreamEvent) -> Option<WriteStreamEvent> {
        match self.stream.handle_event(io, event)? {
            StreamTransition::Opened => Some(WriteStreamEvent::Opened),
            StreamTransition::Closed(error) => {
                self.handshake_complete = false;
                Some(WriteStreamEvent::Closed(error))
            }
            StreamTransition::Message(frame) => match self.decode(&frame) {
                Ok(event) => Some(event),
                Err(err) => {
                    log::warn!("failed to decode write response: {err}");
                    self.handshake_complete = false;
                    match self.stream.fail(io, err) {
                        StreamTransition::Closed(error) => Some(WriteStreamEvent::Closed(error)),
                        _ => None,
                    }
                }
            },
        }
    }

    fn decode(&mut self, frame: &JsonValue) -> FirestoreResult<WriteStreamEvent> {
        if let Some(token) = frame.get("streamToken").and_then(JsonValue::as_str) {
            self.last_stream_token = self.serializer.decode_bytes(token)?;
        }
        if !self.handshake_complete {
            self.handshake_complete = true;
            return Ok(WriteStreamEvent::HandshakeComplete);
        }
        let commit_version = self
            .serializer
            .optional_version(frame.get("commitTime"))?
            .unwrap_or_else(SnapshotVersion::min);
        let results = self
            .serializer
            .decode_write_results(frame.get("writeResults"), commit_version)?;
        Ok(WriteStreamEvent::MutationResults {
            commit_version,
            results,
        })
    }
}
