//! Per-producer deduplication state (message groups).
//!
//! Every producer writes under a source id with its own strictly increasing
//! sequence numbers. A write whose sequence number is not above the last one
//! seen for its source is a duplicate and is answered with the offset already
//! assigned to that source. All group state lives here; callers go through
//! admission, registration, deregistration and split only.
//!
//! Two views are kept per group: the in-memory one, updated on every accepted
//! write, and the durable one, which follows the flushed part of the log and
//! is what the write batches persist.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::record::RecordPart;
use super::request::RejectReason;
use crate::config::RetentionConfig;
use crate::encoding::keycode::PartitionKey;
use crate::encoding::{Key, Value};
use crate::error::{Error, Result};
use crate::store::WriteBatch;

/// First sequence number a producer may use without being registered.
pub const INITIAL_SEQ_NO: u64 = 1;

/// Half-open key range owned by a group; an empty `to` is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub from: Vec<u8>,
    pub to: Vec<u8>,
}

impl KeyRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.from.as_slice() && (self.to.is_empty() || key < self.to.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdState {
    pub seq_no: u64,
    /// Offset of the last accepted write
    pub offset: Option<u64>,
    pub durable_seq_no: u64,
    pub durable_offset: Option<u64>,
    /// Created by registration rather than by a first write
    pub explicit: bool,
    pub key_range: Option<KeyRange>,
    /// Deregistered, waiting for its unflushed writes to become durable
    pub deregistering: bool,
    /// Wall-clock time the partition accepted the last write, in milliseconds
    pub last_write_ms: u64,
}

impl SourceIdState {
    /// Implicit groups expire once every write they made is durable.
    fn can_expire(&self, head_offset: u64) -> bool {
        !self.explicit && !self.deregistering && self.offset.map_or(true, |o| o < head_offset)
    }
}

/// Group state as stored under the source-id key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedGroup {
    pub seq_no: u64,
    pub offset: Option<u64>,
    pub explicit: bool,
    pub key_range: Option<KeyRange>,
    pub last_write_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRegistration {
    pub source_id: String,
    /// Last sequence number treated as already written
    pub start_seq_no: u64,
    pub key_range: Option<KeyRange>,
}

impl GroupRegistration {
    pub fn new(source_id: impl Into<String>, start_seq_no: u64) -> Self {
        Self {
            source_id: source_id.into(),
            start_seq_no,
            key_range: None,
        }
    }

    pub fn key_range(mut self, range: KeyRange) -> Self {
        self.key_range = Some(range);
        self
    }
}

/// Groups replaced atomically by their successors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitRequest {
    pub deregistrations: Vec<String>,
    pub registrations: Vec<GroupRegistration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate { offset: u64, max_seq_no: u64 },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    Removed,
    Deferred,
}

/// Durable group changes carried by one write batch.
#[derive(Debug, Clone, Default)]
pub struct PreparedGroups {
    puts: Vec<(String, PersistedGroup)>,
    deletes: Vec<String>,
}

impl PreparedGroups {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    pub fn write_into(&self, partition: u32, batch: &mut WriteBatch) -> Result<()> {
        for source_id in &self.deletes {
            batch.delete(source_key(partition, source_id));
        }
        for (source_id, group) in &self.puts {
            batch.put(source_key(partition, source_id), group.encode()?);
        }
        Ok(())
    }
}

fn source_key(partition: u32, source_id: &str) -> Vec<u8> {
    PartitionKey::SourceId {
        partition,
        source_id: source_id.to_string(),
    }
    .encode()
}

#[derive(Debug, Default)]
pub struct SourceIdTracker {
    groups: BTreeMap<String, SourceIdState>,
    /// Groups whose durable state must be (re)written
    dirty: BTreeSet<String>,
    /// Finalised deregistrations whose keys must be deleted
    removed: BTreeSet<String>,
}

impl SourceIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores groups from their persisted state.
    pub fn restore(groups: impl IntoIterator<Item = (String, PersistedGroup)>) -> Self {
        let groups = groups
            .into_iter()
            .map(|(id, g)| {
                let state = SourceIdState {
                    seq_no: g.seq_no,
                    offset: g.offset,
                    durable_seq_no: g.seq_no,
                    durable_offset: g.offset,
                    explicit: g.explicit,
                    key_range: g.key_range,
                    deregistering: false,
                    last_write_ms: g.last_write_ms,
                };
                (id, state)
            })
            .collect();
        Self {
            groups,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceIdState> {
        self.groups.get(source_id)
    }

    /// Classifies a write without changing any state.
    pub fn admit(&self, source_id: &str, seq_no: u64) -> Admission {
        match self.groups.get(source_id) {
            None if seq_no > INITIAL_SEQ_NO => Admission::Rejected(RejectReason::UnknownProducer),
            None => Admission::Accepted,
            Some(group) if seq_no <= group.seq_no => match group.offset {
                Some(offset) => Admission::Duplicate {
                    offset,
                    max_seq_no: group.seq_no,
                },
                // Registered with a starting sequence number but never written.
                None => Admission::Rejected(RejectReason::StaleSequence),
            },
            Some(group) if group.deregistering => {
                Admission::Rejected(RejectReason::UnknownProducer)
            }
            Some(_) => Admission::Accepted,
        }
    }

    /// Records an accepted write at `offset`, accepted at wall-clock `now_ms`.
    pub fn record_write(&mut self, source_id: &str, seq_no: u64, offset: u64, now_ms: u64) {
        let group = self
            .groups
            .entry(source_id.to_string())
            .or_insert_with(|| SourceIdState {
                seq_no: 0,
                offset: None,
                durable_seq_no: 0,
                durable_offset: None,
                explicit: false,
                key_range: None,
                deregistering: false,
                last_write_ms: now_ms,
            });
        group.seq_no = seq_no;
        group.offset = Some(offset);
        group.last_write_ms = now_ms;
    }

    /// Creates or updates an explicit group.
    pub fn register(&mut self, registration: GroupRegistration) {
        let GroupRegistration {
            source_id,
            start_seq_no,
            key_range,
        } = registration;

        match self.groups.get_mut(&source_id) {
            Some(group) => {
                group.seq_no = group.seq_no.max(start_seq_no);
                group.durable_seq_no = group.durable_seq_no.max(start_seq_no);
                group.explicit = true;
                group.key_range = key_range;
                group.deregistering = false;
            }
            None => {
                self.groups.insert(
                    source_id.clone(),
                    SourceIdState {
                        seq_no: start_seq_no,
                        offset: None,
                        durable_seq_no: start_seq_no,
                        durable_offset: None,
                        explicit: true,
                        key_range,
                        deregistering: false,
                        last_write_ms: 0,
                    },
                );
            }
        }
        self.removed.remove(&source_id);
        self.dirty.insert(source_id);
    }

    /// Removes a group, or defers the removal while it has writes at or above
    /// `head_offset`.
    pub fn deregister(&mut self, source_id: &str, head_offset: u64) -> Result<Deregistration> {
        let group = self
            .groups
            .get_mut(source_id)
            .ok_or_else(|| Error::UnknownGroup(source_id.to_string()))?;

        if matches!(group.offset, Some(offset) if offset >= head_offset) {
            group.deregistering = true;
            return Ok(Deregistration::Deferred);
        }
        self.groups.remove(source_id);
        self.dirty.remove(source_id);
        self.removed.insert(source_id.to_string());
        Ok(Deregistration::Removed)
    }

    /// Applies all deregistrations and registrations of a split, or none of
    /// them if any deregistered group is unknown.
    pub fn split(&mut self, request: SplitRequest, head_offset: u64) -> Result<()> {
        if let Some(missing) = request
            .deregistrations
            .iter()
            .find(|id| !self.groups.contains_key(id.as_str()))
        {
            return Err(Error::UnknownGroup(missing.clone()));
        }
        for source_id in &request.deregistrations {
            self.deregister(source_id, head_offset)?;
        }
        for registration in request.registrations {
            self.register(registration);
        }
        Ok(())
    }

    /// Builds the split of `source_id` at `boundary` into two successors that
    /// continue its sequence numbers.
    pub fn split_plan(&self, source_id: &str, boundary: &[u8]) -> Result<SplitRequest> {
        let group = self
            .groups
            .get(source_id)
            .ok_or_else(|| Error::UnknownGroup(source_id.to_string()))?;
        let range = group.key_range.clone().unwrap_or_default();

        if !range.contains(boundary) || boundary == range.from.as_slice() {
            return Err(Error::InvalidOperation(format!(
                "split boundary {:?} is not inside the key range of {}",
                boundary, source_id
            )));
        }

        let lower = KeyRange {
            from: range.from,
            to: boundary.to_vec(),
        };
        let upper = KeyRange {
            from: boundary.to_vec(),
            to: range.to,
        };
        Ok(SplitRequest {
            deregistrations: vec![source_id.to_string()],
            registrations: vec![
                GroupRegistration::new(format!("{}#0", source_id), group.seq_no).key_range(lower),
                GroupRegistration::new(format!("{}#1", source_id), group.seq_no).key_range(upper),
            ],
        })
    }

    /// Finalises deferred deregistrations whose writes are all below
    /// `head_offset`.
    pub fn finalize_deregistrations(&mut self, head_offset: u64) -> Vec<String> {
        let done: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| g.deregistering && g.offset.map_or(true, |o| o < head_offset))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            self.groups.remove(id);
            self.dirty.remove(id);
            self.removed.insert(id.clone());
        }
        done
    }

    /// Expires implicit groups whose last write is at least `max_age` old,
    /// then the least recently written ones while more than `max_count`
    /// groups exist. Only groups with every write below `head_offset` are
    /// considered; their keys are deleted by the next batch.
    pub fn expire(
        &mut self,
        retention: &RetentionConfig,
        now_ms: u64,
        head_offset: u64,
    ) -> Vec<String> {
        let cutoff_ms = retention
            .source_id_max_age
            .map(|age| now_ms.saturating_sub(age.as_millis() as u64));
        let mut expired: Vec<String> = match cutoff_ms {
            Some(cutoff_ms) => self
                .groups
                .iter()
                .filter(|(_, g)| g.can_expire(head_offset) && g.last_write_ms <= cutoff_ms)
                .map(|(id, _)| id.clone())
                .collect(),
            None => Vec::new(),
        };

        if let Some(max_count) = retention.source_id_max_count {
            let excess = (self.groups.len() - expired.len()).saturating_sub(max_count);
            if excess > 0 {
                let mut oldest: Vec<(u64, &String)> = self
                    .groups
                    .iter()
                    .filter(|(_, g)| g.can_expire(head_offset))
                    .filter(|(_, g)| cutoff_ms.map_or(true, |cutoff| g.last_write_ms > cutoff))
                    .map(|(id, g)| (g.last_write_ms, id))
                    .collect();
                oldest.sort_unstable();
                let oldest: Vec<String> =
                    oldest.into_iter().take(excess).map(|(_, id)| id.clone()).collect();
                expired.extend(oldest);
            }
        }

        for id in &expired {
            self.groups.remove(id);
            self.dirty.remove(id);
            self.removed.insert(id.clone());
        }
        expired
    }

    /// Wall-clock time at which the next group expires by age, if any group
    /// can expire.
    pub fn next_expiry_ms(&self, retention: &RetentionConfig, head_offset: u64) -> Option<u64> {
        let max_age = retention.source_id_max_age?.as_millis() as u64;
        self.groups
            .values()
            .filter(|g| g.can_expire(head_offset))
            .map(|g| g.last_write_ms.saturating_add(max_age))
            .min()
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    /// Takes the durable group changes for the next batch, including the
    /// state reached by the `flushed` parts.
    pub fn prepare(&mut self, flushed: &[RecordPart]) -> PreparedGroups {
        let mut durable: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for part in flushed.iter().filter(|p| p.part_no == 0) {
            let entry = durable.entry(part.source_id.as_str()).or_insert((0, 0));
            *entry = (entry.0.max(part.seq_no), part.offset);
        }

        let mut ids: BTreeSet<String> = std::mem::take(&mut self.dirty);
        ids.extend(durable.keys().map(|id| id.to_string()));

        let puts = ids
            .into_iter()
            .filter_map(|id| {
                let group = self.groups.get(&id)?;
                let (seq_no, offset) = match durable.get(id.as_str()) {
                    Some((seq_no, offset)) => {
                        (group.durable_seq_no.max(*seq_no), Some(*offset))
                    }
                    None => (group.durable_seq_no, group.durable_offset),
                };
                let persisted = PersistedGroup {
                    seq_no,
                    offset,
                    explicit: group.explicit,
                    key_range: group.key_range.clone(),
                    last_write_ms: group.last_write_ms,
                };
                Some((id, persisted))
            })
            .collect();

        PreparedGroups {
            puts,
            deletes: std::mem::take(&mut self.removed).into_iter().collect(),
        }
    }

    /// Applies the durable view once the batch carrying `prepared` succeeded.
    pub fn commit(&mut self, prepared: &PreparedGroups) {
        for (id, persisted) in &prepared.puts {
            if let Some(group) = self.groups.get_mut(id) {
                group.durable_seq_no = persisted.seq_no;
                group.durable_offset = persisted.offset;
            }
        }
    }

    /// Highest accepted sequence number per source id.
    pub fn max_seq_nos<'a>(
        &self,
        source_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<(String, Option<u64>)> {
        source_ids
            .into_iter()
            .map(|id| (id.to_string(), self.groups.get(id).map(|g| g.seq_no)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SourceIdState)> {
        self.groups.iter()
    }
}
