//! Core custody record and line item types
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::CustodyError;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum CustodyKind {
    #[n(0)]
    Support,
    #[n(1)]
    Permanent,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum CustodyStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Open,
    #[n(3)]
    Closed,
    #[n(4)]
    Late,
}

impl CustodyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyStatus::Pending => "PENDING",
            CustodyStatus::Approved => "APPROVED",
            CustodyStatus::Open => "OPEN",
            CustodyStatus::Closed => "CLOSED",
            CustodyStatus::Late => "LATE",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ItemKind {
    #[n(0)]
    Weapon,
    #[n(1)]
    Ammunition,
    #[n(2)]
    Accessory,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Weapon => "WEAPON",
            ItemKind::Ammunition => "AMMUNITION",
            ItemKind::Accessory => "ACCESSORY",
        }
    }
}

/// Where a line item points: a managed ammunition lot, or a fixed asset
/// (weapons, accessories, and ammunition kept as plain assets).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub enum ItemTarget {
    #[n(0)]
    Lot(#[n(0)] String),
    #[n(1)]
    Asset(#[n(0)] String),
}

impl ItemTarget {
    pub fn id(&self) -> &str {
        match self {
            ItemTarget::Lot(id) | ItemTarget::Asset(id) => id,
        }
    }
}

/// Caller-side description of one requested item; the service resolves the
/// target id against the store when the request is created.
#[derive(Debug, Clone)]
pub struct ItemSpec {
    pub kind: ItemKind,
    pub target_id: String,
    pub quantity: u32,
}

impl ItemSpec {
    pub fn weapon(target_id: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Weapon,
            target_id: target_id.into(),
            quantity: 1,
        }
    }
    pub fn accessory(target_id: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Accessory,
            target_id: target_id.into(),
            quantity: 1,
        }
    }
    pub fn ammunition(target_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            kind: ItemKind::Ammunition,
            target_id: target_id.into(),
            quantity,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct LineItem {
    #[n(0)]
    pub kind: ItemKind,
    #[n(1)]
    pub target: ItemTarget,
    #[n(2)]
    pub quantity: u32,
}

/// An acting user as seen by the service: identity plus whatever the
/// permission collaborator resolved for them.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Option<String>,
    pub class: Option<String>,
    pub capabilities: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            class: None,
            capabilities: vec![],
        }
    }
    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }
    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }
    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.push(capability.to_string());
        self
    }
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Requester identity snapshot kept on the record; the role/class taken at
/// request time drive the ammunition ceiling at approval time.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Party {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub role: Option<String>,
    #[n(2)]
    pub class: Option<String>,
}

impl From<&Actor> for Party {
    fn from(actor: &Actor) -> Self {
        Self {
            id: actor.id.clone(),
            role: actor.role.clone(),
            class: actor.class.clone(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct CustodyRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: CustodyKind,
    #[n(2)]
    pub status: CustodyStatus,
    #[n(3)]
    pub requester: Party,
    #[n(4)]
    pub supervisor: Option<String>,
    #[n(5)]
    pub custodian: Option<String>,
    #[n(6)]
    pub expected_return_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub withdrawn_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub returned_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub reason: String,
    #[n(11)]
    pub notes: String,
    #[n(12)]
    pub items: Vec<LineItem>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
}

impl CustodyRecord {
    pub fn new(
        id: String,
        kind: CustodyKind,
        requester: Party,
        supervisor: Option<String>,
        expected_return_at: Option<TimeStamp<Utc>>,
        reason: &str,
        notes: &str,
    ) -> Self {
        Self {
            id,
            kind,
            status: CustodyStatus::Pending,
            requester,
            supervisor,
            custodian: None,
            expected_return_at,
            withdrawn_at: None,
            returned_at: None,
            approved_at: None,
            reason: reason.to_string(),
            notes: notes.to_string(),
            items: vec![],
            created_at: TimeStamp::new(),
        }
    }

    pub fn is_overdue(&self, now: &TimeStamp<Utc>) -> bool {
        self.status == CustodyStatus::Open
            && self
                .expected_return_at
                .as_ref()
                .is_some_and(|due| due.to_datetime_utc() < now.to_datetime_utc())
    }

    /// Stored status, except an open record past its expected return reads
    /// as late. Late is a derived label, never a stored transition target.
    pub fn effective_status(&self, now: &TimeStamp<Utc>) -> CustodyStatus {
        if self.is_overdue(now) {
            CustodyStatus::Late
        } else {
            self.status
        }
    }

    pub fn total_ammunition(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| i.kind == ItemKind::Ammunition)
            .map(|i| u64::from(i.quantity))
            .sum()
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id.clone(),
            status: self.status.as_str().to_string(),
            requester: self.requester.id.clone(),
            supervisor: self.supervisor.clone(),
            custodian: self.custodian.clone(),
            expected_return_at: self.expected_return_at.as_ref().map(|t| t.rfc3339()),
            withdrawn_at: self.withdrawn_at.as_ref().map(|t| t.rfc3339()),
            returned_at: self.returned_at.as_ref().map(|t| t.rfc3339()),
            approved_at: self.approved_at.as_ref().map(|t| t.rfc3339()),
            items: self
                .items
                .iter()
                .map(|i| ItemSnapshot {
                    kind: i.kind.as_str().to_string(),
                    target: i.target.id().to_string(),
                    quantity: i.quantity,
                })
                .collect(),
        }
    }

    pub fn snapshot_value(&self) -> Result<serde_json::Value, CustodyError> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    /// Append a labelled JSON payload (delivery/return checklist) to the
    /// free-text notes.
    pub fn append_note(
        &mut self,
        label: &str,
        payload: &serde_json::Value,
    ) -> Result<(), CustodyError> {
        let text = serde_json::to_string(payload)?;
        self.notes.push('\n');
        self.notes.push_str(label);
        self.notes.push('=');
        self.notes.push_str(&text);
        Ok(())
    }
}

/// What goes into the audit ledger's before/after columns.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
    pub id: String,
    pub status: String,
    pub requester: String,
    pub supervisor: Option<String>,
    pub custodian: Option<String>,
    pub expected_return_at: Option<String>,
    pub withdrawn_at: Option<String>,
    pub returned_at: Option<String>,
    pub approved_at: Option<String>,
    pub items: Vec<ItemSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    pub kind: String,
    pub target: String,
    pub quantity: u32,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn record_encoding_round_trip() {
        let requester = Party {
            id: "user_1abc".to_string(),
            role: Some("patrol".to_string()),
            class: None,
        };
        let mut record = CustodyRecord::new(
            "custody_1abc".to_string(),
            CustodyKind::Support,
            requester,
            Some("user_1sup".to_string()),
            None,
            "night shift",
            "",
        );
        record.items.push(LineItem {
            kind: ItemKind::Ammunition,
            target: ItemTarget::Lot("lot_1abc".to_string()),
            quantity: 30,
        });

        let encoding = minicbor::to_vec(&record).unwrap();
        let decode: CustodyRecord = minicbor::decode(&encoding).unwrap();

        assert_eq!(record, decode);
    }

    #[test]
    fn open_record_past_due_reads_as_late() {
        let requester = Party {
            id: "user_1abc".to_string(),
            role: None,
            class: None,
        };
        let mut record = CustodyRecord::new(
            "custody_1abc".to_string(),
            CustodyKind::Support,
            requester,
            None,
            Some(TimeStamp::new_with(2025, 1, 1, 8, 0, 0)),
            "",
            "",
        );
        record.status = CustodyStatus::Open;

        let later = TimeStamp::new_with(2025, 1, 2, 8, 0, 0);
        assert!(record.is_overdue(&later));
        assert_eq!(record.effective_status(&later), CustodyStatus::Late);

        let earlier = TimeStamp::new_with(2025, 1, 1, 7, 0, 0);
        assert_eq!(record.effective_status(&earlier), CustodyStatus::Open);
    }

    #[test]
    fn checklist_note_is_appended_with_label() {
        let requester = Party {
            id: "user_1abc".to_string(),
            role: None,
            class: None,
        };
        let mut record = CustodyRecord::new(
            "custody_1abc".to_string(),
            CustodyKind::Support,
            requester,
            None,
            None,
            "",
            "issued clean",
        );

        let checklist = serde_json::json!({"holster": "ok"});
        record.append_note("DELIVERY_CHECKLIST", &checklist).unwrap();

        assert!(record.notes.starts_with("issued clean"));
        assert!(record.notes.contains("DELIVERY_CHECKLIST={\"holster\":\"ok\"}"));
    }
}
