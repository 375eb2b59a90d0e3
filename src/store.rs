use std::path::Path;
use std::sync::Arc;

use sled::{Batch, Db};

use crate::custody::CustodyRecord;
use crate::error::CustodyError;
use crate::inventory::{AmmunitionLot, AmmunitionStock, FixedAsset, MaintenanceOrder};

/// Single keyspace, prefix per logical table. Audit keys embed a
/// zero-padded sequence so lexical order is creation order.
pub(crate) mod keys {
    pub const RECORD: &str = "record/";
    pub const ASSET: &str = "asset/";
    pub const LOT: &str = "lot/";
    pub const STOCK: &str = "stock/";
    pub const MAINTENANCE: &str = "maint/";
    pub const AUDIT: &str = "audit/";

    pub fn record(id: &str) -> String {
        format!("{RECORD}{id}")
    }
    pub fn asset(id: &str) -> String {
        format!("{ASSET}{id}")
    }
    pub fn lot(id: &str) -> String {
        format!("{LOT}{id}")
    }
    pub fn stock(lot_id: &str, location: &str) -> String {
        format!("{STOCK}{lot_id}/{location}")
    }
    pub fn maintenance(id: &str) -> String {
        format!("{MAINTENANCE}{id}")
    }
    pub fn audit(target_ident: &str, seq: u64) -> String {
        format!("{AUDIT}{target_ident}/{seq:020}")
    }
    pub fn audit_scope(target_ident: &str) -> String {
        format!("{AUDIT}{target_ident}/")
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, CustodyError> {
    minicbor::to_vec(value).map_err(|e| CustodyError::Encoding(e.to_string()))
}

pub(crate) fn decode<T: for<'b> minicbor::Decode<'b, ()>>(
    bytes: &[u8],
) -> Result<T, CustodyError> {
    minicbor::decode(bytes).map_err(|e| CustodyError::Encoding(e.to_string()))
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Db>,
}

impl Store {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, CustodyError> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }

    pub fn db(&self) -> Arc<Db> {
        self.db.clone()
    }

    fn get<T: for<'b> minicbor::Decode<'b, ()>>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CustodyError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: minicbor::Encode<()>>(&self, key: &str, value: &T) -> Result<(), CustodyError> {
        self.db.insert(key, encode(value)?)?;
        Ok(())
    }

    fn scan<T: for<'b> minicbor::Decode<'b, ()>>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, CustodyError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (_key, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    // records

    pub fn get_record(&self, id: &str) -> Result<Option<CustodyRecord>, CustodyError> {
        self.get(&keys::record(id))
    }

    pub fn put_record(&self, record: &CustodyRecord) -> Result<(), CustodyError> {
        self.put(&keys::record(&record.id), record)
    }

    pub fn records_for(&self, requester_id: &str) -> Result<Vec<CustodyRecord>, CustodyError> {
        let mut records: Vec<CustodyRecord> = self.scan(keys::RECORD)?;
        records.retain(|r| r.requester.id == requester_id);
        Ok(records)
    }

    // assets and ammunition

    pub fn get_asset(&self, id: &str) -> Result<Option<FixedAsset>, CustodyError> {
        self.get(&keys::asset(id))
    }

    pub fn put_asset(&self, asset: &FixedAsset) -> Result<(), CustodyError> {
        self.put(&keys::asset(&asset.id), asset)
    }

    pub fn get_lot(&self, id: &str) -> Result<Option<AmmunitionLot>, CustodyError> {
        self.get(&keys::lot(id))
    }

    pub fn put_lot(&self, lot: &AmmunitionLot) -> Result<(), CustodyError> {
        self.put(&keys::lot(&lot.id), lot)
    }

    pub fn get_stock(
        &self,
        lot_id: &str,
        location: &str,
    ) -> Result<Option<AmmunitionStock>, CustodyError> {
        self.get(&keys::stock(lot_id, location))
    }

    pub fn put_stock(&self, stock: &AmmunitionStock) -> Result<(), CustodyError> {
        self.put(&keys::stock(&stock.lot_id, &stock.location), stock)
    }

    // maintenance

    pub fn put_maintenance(&self, order: &MaintenanceOrder) -> Result<(), CustodyError> {
        self.put(&keys::maintenance(&order.id), order)
    }

    pub fn has_blocking_maintenance(&self, asset_id: &str) -> Result<bool, CustodyError> {
        let orders: Vec<MaintenanceOrder> = self.scan(keys::MAINTENANCE)?;
        Ok(orders
            .iter()
            .any(|o| o.asset_id == asset_id && o.is_blocking()))
    }

    // batch staging

    pub fn stage_record(
        &self,
        batch: &mut Batch,
        record: &CustodyRecord,
    ) -> Result<(), CustodyError> {
        batch.insert(keys::record(&record.id).as_bytes(), encode(record)?);
        Ok(())
    }

    pub fn stage_asset(&self, batch: &mut Batch, asset: &FixedAsset) -> Result<(), CustodyError> {
        batch.insert(keys::asset(&asset.id).as_bytes(), encode(asset)?);
        Ok(())
    }

    pub fn stage_stock(
        &self,
        batch: &mut Batch,
        stock: &AmmunitionStock,
    ) -> Result<(), CustodyError> {
        batch.insert(
            keys::stock(&stock.lot_id, &stock.location).as_bytes(),
            encode(stock)?,
        );
        Ok(())
    }

    /// Commit every staged mutation atomically. An operation that errors
    /// before this point leaves no trace in the keyspace.
    pub fn apply(&self, batch: Batch) -> Result<(), CustodyError> {
        self.db.apply_batch(batch)?;
        Ok(())
    }
}
