use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use bincode::{Decode, Encode, config};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, StorageError},
    log::Indexed,
};

use super::SnapshotService;

/// Commands replicated into a [`MapService`].
///
/// Mutations carry the issuing session and a per-session sequence number so
/// a command redelivered after a leader change is applied exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum MapCommand {
    Put {
        session: u64,
        sequence: u64,
        key: String,
        value: Vec<u8>,
    },
    Remove {
        session: u64,
        sequence: u64,
        key: String,
    },
    CloseSession {
        session: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct MapValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Whole service state; ordered maps keep the snapshot stream
/// deterministic.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct MapState {
    last_applied: u64,
    next_version: u64,
    entries: BTreeMap<String, MapValue>,
    /// Highest applied sequence number per session.
    sessions: BTreeMap<u64, u64>,
}

impl Default for MapState {
    fn default() -> Self {
        Self {
            last_applied: 0,
            // Version numbers are one-based so 0 can mean "never written".
            next_version: 1,
            entries: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }
}

/// A replicated key/value map: the reference service for the snapshot
/// contract. Values carry a monotonically increasing version so replicas
/// can be compared for equivalence after restore-plus-replay.
#[derive(Debug, Default)]
pub struct MapService {
    state: MapState,
}

impl MapService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.state.entries.get(key).map(|v| v.value.as_slice())
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        self.state.entries.get(key).map(|v| v.version)
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    /// Index of the last applied entry; replay resumes at the next one.
    pub fn last_applied(&self) -> u64 {
        self.state.last_applied
    }

    /// True when this (session, sequence) was already applied.
    fn is_duplicate(&self, session: u64, sequence: u64) -> bool {
        self.state
            .sessions
            .get(&session)
            .is_some_and(|&applied| sequence <= applied)
    }

    fn record_sequence(&mut self, session: u64, sequence: u64) {
        self.state.sessions.insert(session, sequence);
    }
}

impl SnapshotService for MapService {
    type Command = MapCommand;

    fn apply(&mut self, entry: &Indexed<MapCommand>) -> Result<()> {
        match &entry.entry {
            MapCommand::Put {
                session,
                sequence,
                key,
                value,
            } => {
                if self.is_duplicate(*session, *sequence) {
                    debug!("skipping duplicate put: session={}, sequence={}", session, sequence);
                } else {
                    let version = self.state.next_version;
                    self.state.next_version += 1;
                    self.state.entries.insert(
                        key.clone(),
                        MapValue {
                            value: value.clone(),
                            version,
                        },
                    );
                    self.record_sequence(*session, *sequence);
                }
            }
            MapCommand::Remove {
                session,
                sequence,
                key,
            } => {
                if self.is_duplicate(*session, *sequence) {
                    debug!(
                        "skipping duplicate remove: session={}, sequence={}",
                        session, sequence
                    );
                } else {
                    self.state.entries.remove(key);
                    self.record_sequence(*session, *sequence);
                }
            }
            MapCommand::CloseSession { session } => {
                self.state.sessions.remove(session);
            }
        }
        self.state.last_applied = entry.index;
        Ok(())
    }

    fn backup(&self, mut sink: &mut dyn Write) -> Result<()> {
        bincode::encode_into_std_write(&self.state, &mut sink, config::standard())?;
        Ok(())
    }

    fn restore(&mut self, mut source: &mut dyn Read) -> Result<()> {
        self.state = bincode::decode_from_std_read(&mut source, config::standard())
            .map_err(StorageError::CorruptSnapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(index: u64, sequence: u64, key: &str, value: &[u8]) -> Indexed<MapCommand> {
        Indexed {
            index,
            entry: MapCommand::Put {
                session: 1,
                sequence,
                key: key.to_string(),
                value: value.to_vec(),
            },
            size: 0,
        }
    }

    #[test]
    fn test_backup_restore_round_trip() {
        let mut service = MapService::new();
        service
            .apply(&put(1, 1, "foo", b"Hello world!"))
            .unwrap();

        let mut snapshot = Vec::new();
        service.backup(&mut snapshot).unwrap();

        let mut restored = MapService::new();
        restored.restore(&mut snapshot.as_slice()).unwrap();

        assert_eq!(restored.get("foo"), Some(b"Hello world!".as_slice()));
        assert_eq!(restored.last_applied(), 1);
        assert_eq!(restored.version("foo"), service.version("foo"));
    }

    #[test]
    fn test_backup_is_deterministic() {
        let mut a = MapService::new();
        let mut b = MapService::new();
        for service in [&mut a, &mut b] {
            service.apply(&put(1, 1, "k1", b"v1")).unwrap();
            service.apply(&put(2, 2, "k2", b"v2")).unwrap();
        }

        let mut bytes_a = Vec::new();
        let mut bytes_b = Vec::new();
        a.backup(&mut bytes_a).unwrap();
        b.backup(&mut bytes_b).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_duplicate_sequence_applied_once() {
        let mut service = MapService::new();
        service.apply(&put(1, 1, "k", b"first")).unwrap();
        // Redelivery of sequence 1 must not overwrite.
        service.apply(&put(2, 1, "k", b"second")).unwrap();

        assert_eq!(service.get("k"), Some(b"first".as_slice()));
        assert_eq!(service.version("k"), Some(1));
        assert_eq!(service.last_applied(), 2);
    }

    #[test]
    fn test_remove_and_close_session() {
        let mut service = MapService::new();
        service.apply(&put(1, 1, "k", b"v")).unwrap();
        service
            .apply(&Indexed {
                index: 2,
                entry: MapCommand::Remove {
                    session: 1,
                    sequence: 2,
                    key: "k".to_string(),
                },
                size: 0,
            })
            .unwrap();
        assert!(service.is_empty());

        service
            .apply(&Indexed {
                index: 3,
                entry: MapCommand::CloseSession { session: 1 },
                size: 0,
            })
            .unwrap();
        // A new session may reuse sequence numbers after close.
        service.apply(&put(4, 1, "k", b"again")).unwrap();
        assert_eq!(service.get("k"), Some(b"again".as_slice()));
    }

    #[test]
    fn test_restore_replaces_existing_state() {
        let mut source = MapService::new();
        source.apply(&put(1, 1, "only", b"kept")).unwrap();
        let mut snapshot = Vec::new();
        source.backup(&mut snapshot).unwrap();

        let mut target = MapService::new();
        target.apply(&put(1, 1, "stale", b"dropped")).unwrap();
        target.restore(&mut snapshot.as_slice()).unwrap();

        assert_eq!(target.get("stale"), None);
        assert_eq!(target.get("only"), Some(b"kept".as_slice()));
    }

    #[test]
    fn test_restore_corrupt_stream() {
        let mut service = MapService::new();
        let err = service.restore(&mut &b"\xff\xff\xff"[..]).unwrap_err();
        assert!(matches!(err, StorageError::CorruptSnapshot(_)));
    }
}
