use chrono::Utc;

use crate::custody::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum AssetClass {
    #[n(0)]
    Weapon,
    #[n(1)]
    Ammunition,
    #[n(2)]
    Accessory,
}

/// A durable armory asset. `quantity` only carries meaning for
/// ammunition-classed assets; weapons and accessories are tracked per unit.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct FixedAsset {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub class: AssetClass,
    #[n(3)]
    pub calibre: String,
    #[n(4)]
    pub serial_number: String,
    #[n(5)]
    pub active: bool,
    #[n(6)]
    pub quantity: u32,
}

impl FixedAsset {
    pub fn new(id: impl Into<String>, name: &str, class: AssetClass) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            class,
            calibre: String::new(),
            serial_number: String::new(),
            active: true,
            quantity: 0,
        }
    }
    pub fn with_calibre(mut self, calibre: &str) -> Self {
        self.calibre = calibre.to_string();
        self
    }
    pub fn with_serial_number(mut self, serial_number: &str) -> Self {
        self.serial_number = serial_number.to_string();
        self
    }
    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum LotStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Inactive,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AmmunitionLot {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub calibre: String,
    #[n(2)]
    pub lot_number: String,
    #[n(3)]
    pub expires_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub status: LotStatus,
}

impl AmmunitionLot {
    pub fn new(id: impl Into<String>, calibre: &str, lot_number: &str) -> Self {
        Self {
            id: id.into(),
            calibre: calibre.to_string(),
            lot_number: lot_number.to_string(),
            expires_at: None,
            status: LotStatus::Active,
        }
    }
    pub fn with_expiry(mut self, expires_at: TimeStamp<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Counters for one lot at one storage location. Reservation moves units
/// between the two counters; it never creates or destroys them.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AmmunitionStock {
    #[n(0)]
    pub lot_id: String,
    #[n(1)]
    pub location: String,
    #[n(2)]
    pub available: u32,
    #[n(3)]
    pub reserved: u32,
}

impl AmmunitionStock {
    pub fn empty(lot_id: &str, location: &str) -> Self {
        Self {
            lot_id: lot_id.to_string(),
            location: location.to_string(),
            available: 0,
            reserved: 0,
        }
    }
    pub fn with_available(mut self, available: u32) -> Self {
        self.available = available;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MaintenanceKind {
    #[n(0)]
    Preventive,
    #[n(1)]
    Corrective,
    #[n(2)]
    Decommission,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct MaintenanceOrder {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub asset_id: String,
    #[n(2)]
    pub kind: MaintenanceKind,
    #[n(3)]
    pub started_at: TimeStamp<Utc>,
    #[n(4)]
    pub ended_at: Option<TimeStamp<Utc>>,
    #[n(5)]
    pub impacts_availability: bool,
    #[n(6)]
    pub notes: String,
}

impl MaintenanceOrder {
    pub fn open(id: impl Into<String>, asset_id: &str, kind: MaintenanceKind) -> Self {
        Self {
            id: id.into(),
            asset_id: asset_id.to_string(),
            kind,
            started_at: TimeStamp::new(),
            ended_at: None,
            impacts_availability: true,
            notes: String::new(),
        }
    }
    pub fn without_availability_impact(mut self) -> Self {
        self.impacts_availability = false;
        self
    }
    pub fn close(mut self) -> Self {
        self.ended_at = Some(TimeStamp::new());
        self
    }

    /// An order still running with availability impact blocks delivery of
    /// the referenced weapon.
    pub fn is_blocking(&self) -> bool {
        self.ended_at.is_none() && self.impacts_availability
    }
}
