//! Append-only hash-chained audit ledger
//!
//! Every lifecycle transition lands here as one event chained per target:
//! `hash_prev` of a new event must equal the `hash_current` of the target's
//! most recent event (empty for the first). Entries are never updated or
//! deleted; replaying a target's chain detects tampering and deletion gaps.

use std::sync::Arc;

use chrono::Utc;
use sled::{Batch, Db};

use crate::custody::TimeStamp;
use crate::error::CustodyError;
use crate::store::{self, keys};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventKind {
    #[n(0)]
    Solicitar,
    #[n(1)]
    Aprovar,
    #[n(2)]
    Entregar,
    #[n(3)]
    Devolver,
    #[n(4)]
    Outro,
}

impl EventKind {
    /// Stable wire tag; consumers and reports key off these.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Solicitar => "SOLICITAR",
            EventKind::Aprovar => "APROVAR",
            EventKind::Entregar => "ENTREGAR",
            EventKind::Devolver => "DEVOLVER",
            EventKind::Outro => "OUTRO",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TargetKind {
    #[n(0)]
    CustodyRecord,
    #[n(1)]
    FixedAsset,
    #[n(2)]
    AmmunitionLot,
}

impl TargetKind {
    fn label(&self) -> &'static str {
        match self {
            TargetKind::CustodyRecord => "custody_record",
            TargetKind::FixedAsset => "fixed_asset",
            TargetKind::AmmunitionLot => "ammunition_lot",
        }
    }
}

/// Polymorphic reference to the entity an event is about.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct TargetRef {
    #[n(0)]
    pub kind: TargetKind,
    #[n(1)]
    pub id: String,
}

impl TargetRef {
    pub fn custody(id: &str) -> Self {
        Self {
            kind: TargetKind::CustodyRecord,
            id: id.to_string(),
        }
    }
    pub fn asset(id: &str) -> Self {
        Self {
            kind: TargetKind::FixedAsset,
            id: id.to_string(),
        }
    }
    pub fn lot(id: &str) -> Self {
        Self {
            kind: TargetKind::AmmunitionLot,
            id: id.to_string(),
        }
    }

    pub fn ident(&self) -> String {
        format!("armory.{}:{}", self.kind.label(), self.id)
    }
}

/// Caller metadata captured alongside an event when available.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AuditEvent {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub actor: Option<String>,
    #[n(2)]
    pub target: TargetRef,
    #[n(3)]
    pub kind: EventKind,
    #[n(4)]
    pub message: String,
    #[n(5)]
    pub before: Option<String>,
    #[n(6)]
    pub after: Option<String>,
    #[n(7)]
    pub hash_prev: String,
    #[n(8)]
    pub hash_current: String,
    #[n(9)]
    pub recorded_at: TimeStamp<Utc>,
    #[n(10)]
    pub ip: Option<String>,
    #[n(11)]
    pub user_agent: Option<String>,
}

fn chain_hash(
    hash_prev: &str,
    recorded_at: &str,
    actor: &str,
    target_ident: &str,
    event_tag: &str,
    before: &str,
    after: &str,
) -> String {
    let payload =
        format!("{hash_prev}{recorded_at}{actor}{target_ident}{event_tag}{before}{after}");
    sha256::digest(payload)
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

pub struct Ledger {
    db: Arc<Db>,
}

impl Ledger {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn head(&self, target: &TargetRef) -> Result<Option<AuditEvent>, CustodyError> {
        let last = self
            .db
            .scan_prefix(keys::audit_scope(&target.ident()))
            .last();
        match last {
            Some(entry) => {
                let (_key, value) = entry?;
                Ok(Some(store::decode(&value)?))
            }
            None => Ok(None),
        }
    }

    /// `hash_current` of the target's most recent event; empty string when
    /// the target has no history yet.
    pub fn latest_hash_for(&self, target: &TargetRef) -> Result<String, CustodyError> {
        Ok(self
            .head(target)?
            .map(|e| e.hash_current)
            .unwrap_or_default())
    }

    fn seal(
        &self,
        actor: Option<&str>,
        target: TargetRef,
        kind: EventKind,
        message: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        ctx: Option<&RequestContext>,
    ) -> Result<AuditEvent, CustodyError> {
        let head = self.head(&target)?;
        let hash_prev = head.as_ref().map(|e| e.hash_current.clone()).unwrap_or_default();
        let seq = head.map(|e| e.seq + 1).unwrap_or(1);

        let before = before.map(|v| serde_json::to_string(&v)).transpose()?;
        let after = after.map(|v| serde_json::to_string(&v)).transpose()?;

        let recorded_at = TimeStamp::new();
        let hash_current = chain_hash(
            &hash_prev,
            &recorded_at.rfc3339(),
            actor.unwrap_or("0"),
            &target.ident(),
            kind.as_str(),
            before.as_deref().unwrap_or(""),
            after.as_deref().unwrap_or(""),
        );

        Ok(AuditEvent {
            seq,
            actor: actor.map(str::to_string),
            target,
            kind,
            message: clip(message, 255),
            before,
            after,
            hash_prev,
            hash_current,
            recorded_at,
            ip: ctx.and_then(|c| c.ip.clone()),
            user_agent: ctx.and_then(|c| c.user_agent.as_deref().map(|ua| clip(ua, 512))),
        })
    }

    /// Persist a single event for `target`, chaining it onto the target's
    /// latest hash. This is the standalone entry point for callers outside
    /// the lifecycle service (jobs, corrections logged as `Outro`).
    pub fn log_event(
        &self,
        actor: Option<&str>,
        target: TargetRef,
        kind: EventKind,
        message: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        ctx: Option<&RequestContext>,
    ) -> Result<AuditEvent, CustodyError> {
        let event = self.seal(actor, target, kind, message, before, after, ctx)?;
        self.append(&event)?;
        Ok(event)
    }

    /// Seal an event and stage its insert into the caller's batch so it
    /// commits atomically with the mutation it describes.
    pub(crate) fn stage_event(
        &self,
        batch: &mut Batch,
        actor: Option<&str>,
        target: TargetRef,
        kind: EventKind,
        message: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Result<AuditEvent, CustodyError> {
        let event = self.seal(actor, target, kind, message, before, after, None)?;
        let key = keys::audit(&event.target.ident(), event.seq);
        batch.insert(key.as_bytes(), store::encode(&event)?);
        Ok(event)
    }

    /// Append-only enforcement: an event whose `(target, seq)` slot is
    /// already occupied is rejected and the ledger is left untouched.
    pub fn append(&self, event: &AuditEvent) -> Result<(), CustodyError> {
        let key = keys::audit(&event.target.ident(), event.seq);
        if self.db.contains_key(&key)? {
            return Err(CustodyError::AppendOnly {
                target: event.target.ident(),
                seq: event.seq,
            });
        }
        self.db.insert(key.as_bytes(), store::encode(event)?)?;
        Ok(())
    }

    /// All events for a target in creation order.
    pub fn events_for(&self, target: &TargetRef) -> Result<Vec<AuditEvent>, CustodyError> {
        let mut events = Vec::new();
        for entry in self.db.scan_prefix(keys::audit_scope(&target.ident())) {
            let (_key, value) = entry?;
            events.push(store::decode(&value)?);
        }
        Ok(events)
    }

    /// Replay a target's chain: the first entry must start from the empty
    /// hash, every link must match, and every `hash_current` must recompute
    /// from its own payload. Returns the number of verified entries.
    pub fn verify_chain(&self, target: &TargetRef) -> Result<usize, CustodyError> {
        let events = self.events_for(target)?;
        let mut expected_prev = String::new();
        for event in &events {
            let recomputed = chain_hash(
                &event.hash_prev,
                &event.recorded_at.rfc3339(),
                event.actor.as_deref().unwrap_or("0"),
                &event.target.ident(),
                event.kind.as_str(),
                event.before.as_deref().unwrap_or(""),
                event.after.as_deref().unwrap_or(""),
            );
            if event.hash_prev != expected_prev || recomputed != event.hash_current {
                return Err(CustodyError::ChainBroken {
                    target: target.ident(),
                    seq: event.seq,
                });
            }
            expected_prev = event.hash_current.clone();
        }
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_hash_is_deterministic() {
        let a = chain_hash("", "2025-01-01T08:00:00+00:00", "user_1", "armory.custody_record:c1", "SOLICITAR", "", "{}");
        let b = chain_hash("", "2025-01-01T08:00:00+00:00", "user_1", "armory.custody_record:c1", "SOLICITAR", "", "{}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = chain_hash(&a, "2025-01-01T08:00:00+00:00", "user_1", "armory.custody_record:c1", "SOLICITAR", "", "{}");
        assert_ne!(a, c);
    }

    #[test]
    fn target_ident_shape() {
        assert_eq!(
            TargetRef::custody("custody_1abc").ident(),
            "armory.custody_record:custody_1abc"
        );
        assert_eq!(TargetRef::lot("lot_1abc").ident(), "armory.ammunition_lot:lot_1abc");
    }
}
