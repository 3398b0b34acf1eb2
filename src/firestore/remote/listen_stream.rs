use serde_json::{json, Value as JsonValue};

use crate::firestore::core::target::TargetData;
use crate::firestore::error::FirestoreError;
use crate::firestore::model::{SnapshotVersion, TargetId};
use crate::firestore::remote::connection::StreamKind;
use crate::firestore::remote::persistent_stream::{
    PersistentStream, StreamEvent, StreamIo, StreamTransition,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    decode_watch_change, snapshot_version_from_listen_response, WatchChange,
};

/// What the Listen stream reports to the remote store.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenStreamEvent {
    Opened,
    WatchChange {
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    },
    Closed(Option<FirestoreError>),
}

/// Listen stream: registers targets and decodes watch changes.
#[derive(Debug)]
pub struct ListenStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

impl ListenStream {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            stream: PersistentStream::new(StreamKind::Listen),
            serializer,
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

    pub fn watch(&mut self, io: &dyn StreamIo, target_data: &TargetData) {
        let frame = json!({
            "database": self.serializer.database_name(),
            "addTarget": self.serializer.encode_target(target_data),
        });
        self.stream.send(io, frame);
    }

    pub fn unwatch(&mut self, io: &dyn StreamIo, target_id: TargetId) {
        let frame = json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.stream.send(io, frame);
    }

    pub fn handle_event(&mut self, io: &dyn StreamIo, event: StreamEvent) -> Option<ListenStreamEvent> {
        match self.stream.handle_event(io, event)? {
            StreamTransition::Opened => Some(ListenStreamEvent::Opened),
            StreamTransition::Closed(error) => Some(ListenStreamEvent::Closed(error)),
            StreamTransition::Message(frame) => self.decode(io, &frame),
        }
    }

    fn decode(&mut self, io: &dyn StreamIo, frame: &JsonValue) -> Option<ListenStreamEvent> {
        let decoded = decode_watch_change(&self.serializer, frame).and_then(|change| {
            snapshot_version_from_listen_response(&self.serializer, frame)
                .map(|snapshot_version| (change, snapshot_version))
        });
        match decoded {
            Ok((Some(change), snapshot_version)) => Some(ListenStreamEvent::WatchChange {
                change,
                snapshot_version,
            }),
            Ok((None, _)) => {
                log::debug!("ignoring unrecognized listen frame");
                None
            }
            Err(err) => {
                log::warn!("failed to decode listen frame: {err}");
                match self.stream.fail(io, err) {
                    StreamTransition::Closed(error) => Some(ListenStreamEvent::Closed(error)),
                    _ => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::TargetPurpose;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::persistent_stream::testing::RecordingStreamIo;
    use crate::firestore::remote::watch_change::WatchTargetChangeState;

    fn open_stream(io: &RecordingStreamIo) -> ListenStream {
        let mut stream = ListenStream::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        stream.stream_mut().start(io);
        let generation = stream.stream().generation();
        let opened = stream.handle_event(
            io,
            StreamEvent::Opened {
                kind: StreamKind::Listen,
                generation,
            },
        );
        assert_eq!(opened, Some(ListenStreamEvent::Opened));
        stream
    }

    #[test]
    fn watch_sends_add_target_with_resume_token() {
        let io = RecordingStreamIo::default();
        let mut stream = open_stream(&io);
        let target = Query::collection(ResourcePath::from_segments(["rooms"])).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(vec![1, 2], SnapshotVersion::from_micros(5));
        stream.watch(&io, &data);
        stream.unwatch(&io, 2);

        let sent = io.sent(StreamKind::Listen);
        assert_eq!(sent[0]["addTarget"]["targetId"], json!(2));
        assert_eq!(sent[0]["addTarget"]["resumeToken"], json!("AQI="));
        assert_eq!(sent[1]["removeTarget"], json!(2));
    }

    #[test]
    fn decodes_changes_with_global_snapshot_version() {
        let io = RecordingStreamIo::default();
        let mut stream = open_stream(&io);
        let generation = stream.stream().generation();
        let event = stream.handle_event(
            &io,
            StreamEvent::Message {
                kind: StreamKind::Listen,
                generation,
                frame: json!({ "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": "1970-01-01T00:00:03Z" } }),
            },
        );
        let Some(ListenStreamEvent::WatchChange {
            change: WatchChange::TargetChange(change),
            snapshot_version,
        }) = event
        else {
            panic!("expected a target change");
        };
        assert_eq!(change.state, WatchTargetChangeState::NoChange);
        assert_eq!(snapshot_version, SnapshotVersion::from_micros(3_000_000));
    }

    #[test]
    fn malformed_frame_fails_the_stream() {
        let io = RecordingStreamIo::default();
        let mut stream = open_stream(&io);
        let generation = stream.stream().generation();
        let event = stream.handle_event(
            &io,
            StreamEvent::Message {
                kind: StreamKind::Listen,
                generation,
                frame: json!({ "documentRemove": {} }),
            },
        );
        assert!(matches!(event, Some(ListenStreamEvent::Closed(Some(_)))));
        assert!(!stream.is_started());
    }
}
