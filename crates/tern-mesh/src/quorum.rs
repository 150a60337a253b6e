//! Replica comparison and majority vote
//!
//! Pure functions over a file's replicas, in node id order. Mismatches are
//! classified in fixed priority: version, then metadata checksum, then
//! content checksum.

use std::collections::BTreeMap;

use serde::Serialize;
use tern_proto::{NodeId, ReplicaRecord};

/// Category of disagreement between replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Versions differ
    Version,
    /// Metadata checksums differ
    MetaCrc,
    /// Content checksums differ
    FileCrc,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchKind::Version => write!(f, "version"),
            MismatchKind::MetaCrc => write!(f, "meta_crc"),
            MismatchKind::FileCrc => write!(f, "file_crc"),
        }
    }
}

/// One repair step: copy the authoritative replica onto the faulty one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixPlan {
    /// What disagrees
    pub kind: MismatchKind,
    /// Node whose record wins
    pub authoritative: NodeId,
    /// Node to overwrite
    pub faulty: NodeId,
}

/// Most frequent value; ties go to the value seen first
pub fn majority<T: PartialEq + Copy>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut tally: Vec<(T, usize)> = Vec::new();
    for value in values {
        match tally.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }

    let mut best: Option<(T, usize)> = None;
    for (value, count) in tally {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

/// First mismatch against the first replica, in priority order
pub fn detect_mismatch(replicas: &BTreeMap<NodeId, ReplicaRecord>) -> Option<MismatchKind> {
    let (_, reference) = replicas.iter().next()?;
    let others = || replicas.values().skip(1);

    if others().any(|r| r.version != reference.version) {
        Some(MismatchKind::Version)
    } else if others().any(|r| r.meta_crc != reference.meta_crc) {
        Some(MismatchKind::MetaCrc)
    } else if others().any(|r| r.file_crc != reference.file_crc) {
        Some(MismatchKind::FileCrc)
    } else {
        None
    }
}

/// Pick one authoritative and one faulty replica, or `None` when all agree.
///
/// Versions: the highest version wins and the lowest is overwritten.
/// Checksums: the majority value wins and the first node off it is
/// overwritten. Ties resolve to the first node in id order.
pub fn plan_fix(replicas: &BTreeMap<NodeId, ReplicaRecord>) -> Option<FixPlan> {
    match detect_mismatch(replicas)? {
        MismatchKind::Version => {
            let mut newest: Option<(&NodeId, u64)> = None;
            let mut oldest: Option<(&NodeId, u64)> = None;
            for (node, record) in replicas {
                if newest.map_or(true, |(_, v)| record.version > v) {
                    newest = Some((node, record.version));
                }
                if oldest.map_or(true, |(_, v)| record.version < v) {
                    oldest = Some((node, record.version));
                }
            }
            let (authoritative, _) = newest?;
            let (faulty, _) = oldest?;
            Some(FixPlan {
                kind: MismatchKind::Version,
                authoritative: authoritative.clone(),
                faulty: faulty.clone(),
            })
        }
        MismatchKind::MetaCrc => plan_by_majority(replicas, MismatchKind::MetaCrc, |r| r.meta_crc),
        MismatchKind::FileCrc => plan_by_majority(replicas, MismatchKind::FileCrc, |r| r.file_crc),
    }
}

fn plan_by_majority(
    replicas: &BTreeMap<NodeId, ReplicaRecord>,
    kind: MismatchKind,
    checksum: impl Fn(&ReplicaRecord) -> u32,
) -> Option<FixPlan> {
    let winner = majority(replicas.values().map(&checksum))?;
    let authoritative = replicas
        .iter()
        .find(|(_, r)| checksum(r) == winner)
        .map(|(node, _)| node)?;
    let faulty = replicas
        .iter()
        .find(|(_, r)| checksum(r) != winner)
        .map(|(node, _)| node)?;
    Some(FixPlan {
        kind,
        authoritative: authoritative.clone(),
        faulty: faulty.clone(),
    })
}
