//! Service layer API for custody lifecycle operations
//!
//! Every operation runs as one atomic unit of work: take the write lock,
//! read and validate, stage every mutation (record, inventory, audit event)
//! into one batch, apply it once. A failure anywhere before the apply
//! leaves the keyspace untouched.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Local, Utc};
use sled::{Batch, Db};

use crate::audit::{EventKind, Ledger, TargetRef};
use crate::custody::{
    Actor, CustodyKind, CustodyRecord, CustodyStatus, ItemKind, ItemSpec, ItemTarget, LineItem,
    Party, TimeStamp,
};
use crate::error::CustodyError;
use crate::inventory::{AmmunitionStock, AssetClass, FixedAsset};
use crate::policy::{self, AmmoView, PolicyConfig, WeaponView};
use crate::store::Store;
use crate::utils;

pub const DEFAULT_LOCATION: &str = "ALMOXARIFADO";

pub struct CustodyService {
    store: Store,
    ledger: Ledger,
    config: PolicyConfig,
    write_lock: Mutex<()>,
}

impl CustodyService {
    pub fn new(db: Arc<Db>, config: PolicyConfig) -> Self {
        Self {
            store: Store::new(db.clone()),
            ledger: Ledger::new(db),
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // Serializes every read-validate-mutate sequence, including the audit
    // chain's read-latest-then-insert.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, record_id: &str) -> Result<CustodyRecord, CustodyError> {
        self.store.get_record(record_id)?.ok_or_else(|| {
            CustodyError::NotFound(format!("custody record {record_id} not found"))
        })
    }

    /// Resolve line items against the store into the views the policy
    /// checks evaluate. Accessories carry no calibre rules and are skipped.
    fn resolve_views(
        &self,
        record: &CustodyRecord,
    ) -> Result<(Vec<WeaponView>, Vec<AmmoView>), CustodyError> {
        let mut weapons = Vec::new();
        let mut ammunition = Vec::new();
        for item in &record.items {
            match item.kind {
                ItemKind::Weapon => {
                    let id = item.target.id();
                    let asset = self.store.get_asset(id)?.ok_or_else(|| {
                        CustodyError::NotFound(format!("weapon {id} not found"))
                    })?;
                    weapons.push(WeaponView {
                        in_maintenance: self.store.has_blocking_maintenance(&asset.id)?,
                        calibre: policy::normalized_calibre(&asset.calibre),
                        asset_id: asset.id,
                    });
                }
                ItemKind::Ammunition => {
                    let calibre = match &item.target {
                        ItemTarget::Lot(id) => self
                            .store
                            .get_lot(id)?
                            .map(|lot| lot.calibre)
                            .ok_or_else(|| {
                                CustodyError::NotFound(format!("ammunition lot {id} not found"))
                            })?,
                        ItemTarget::Asset(id) => self
                            .store
                            .get_asset(id)?
                            .map(|asset| asset.calibre)
                            .ok_or_else(|| {
                                CustodyError::NotFound(format!("ammunition {id} not found"))
                            })?,
                    };
                    ammunition.push(AmmoView {
                        target: item.target.clone(),
                        calibre: policy::normalized_calibre(&calibre),
                        quantity: item.quantity,
                    });
                }
                ItemKind::Accessory => {}
            }
        }
        Ok((weapons, ammunition))
    }

    /// Open a support custody request in `Pending` state.
    ///
    /// No inventory moves yet; reservation happens at approval. The
    /// requester must not hold a late or overdue custody record.
    pub fn request_custody(
        &self,
        requester: &Actor,
        supervisor: Option<&Actor>,
        items: &[ItemSpec],
        expected_return_at: Option<TimeStamp<Utc>>,
        reason: &str,
        notes: &str,
    ) -> Result<CustodyRecord, CustodyError> {
        let _guard = self.lock();

        let now = TimeStamp::new();
        let blocked = self
            .store
            .records_for(&requester.id)?
            .iter()
            .any(|r| r.effective_status(&now) == CustodyStatus::Late);
        if blocked {
            return Err(CustodyError::Precondition(
                "requester has a late or overdue custody record and cannot open a new request"
                    .to_string(),
            ));
        }

        let mut record = CustodyRecord::new(
            utils::new_uuid_to_bech32("custody_")?,
            CustodyKind::Support,
            Party::from(requester),
            supervisor.map(|s| s.id.clone()),
            expected_return_at,
            reason,
            notes,
        );

        for spec in items {
            match spec.kind {
                ItemKind::Weapon | ItemKind::Accessory => {
                    let known = self
                        .store
                        .get_asset(&spec.target_id)?
                        .is_some_and(|a| a.active);
                    if !known {
                        return Err(CustodyError::NotFound(format!(
                            "asset {} not found or inactive",
                            spec.target_id
                        )));
                    }
                    record.items.push(LineItem {
                        kind: spec.kind,
                        target: ItemTarget::Asset(spec.target_id.clone()),
                        quantity: if spec.quantity == 0 { 1 } else { spec.quantity },
                    });
                }
                ItemKind::Ammunition => {
                    if spec.quantity == 0 {
                        return Err(CustodyError::InvalidInput(
                            "ammunition quantity must be greater than zero".to_string(),
                        ));
                    }
                    // a managed lot wins; an active ammunition-classed asset
                    // is accepted as the fallback target
                    let target = if self.store.get_lot(&spec.target_id)?.is_some() {
                        ItemTarget::Lot(spec.target_id.clone())
                    } else {
                        let fallback = self
                            .store
                            .get_asset(&spec.target_id)?
                            .filter(|a| a.class == AssetClass::Ammunition && a.active);
                        match fallback {
                            Some(asset) => ItemTarget::Asset(asset.id),
                            None => {
                                return Err(CustodyError::NotFound(format!(
                                    "ammunition {} not found",
                                    spec.target_id
                                )));
                            }
                        }
                    };
                    record.items.push(LineItem {
                        kind: spec.kind,
                        target,
                        quantity: spec.quantity,
                    });
                }
            }
        }

        let mut batch = Batch::default();
        self.store.stage_record(&mut batch, &record)?;
        self.ledger.stage_event(
            &mut batch,
            Some(requester.id.as_str()),
            TargetRef::custody(&record.id),
            EventKind::Solicitar,
            "support custody request created",
            None,
            Some(record.snapshot_value()?),
        )?;
        self.store.apply(batch)?;

        tracing::info!(record = %record.id, requester = %requester.id, "custody requested");
        Ok(record)
    }

    /// Approve a pending request and reserve its ammunition.
    ///
    /// Lot-targeted items move units from available to reserved in the
    /// location's stock row; ammunition-classed assets are debited
    /// directly.
    pub fn approve_custody(
        &self,
        record_id: &str,
        supervisor: &Actor,
        location: Option<&str>,
    ) -> Result<CustodyRecord, CustodyError> {
        let _guard = self.lock();
        let location = location.unwrap_or(DEFAULT_LOCATION);

        let mut record = self.load(record_id)?;
        if record.status != CustodyStatus::Pending {
            return Err(CustodyError::Precondition(
                "only pending custody records can be approved".to_string(),
            ));
        }
        policy::check_dual_control(
            &self.config,
            &record.requester.id,
            &supervisor.id,
            "segregation of duty: the supervisor cannot be the requester",
        )?;

        let (weapons, ammunition) = self.resolve_views(&record)?;
        policy::check_calibre_compatibility(&weapons, &ammunition)?;
        policy::check_ammo_ceiling(&self.config, &record.requester, record.total_ammunition())?;

        let mut inventory = InventoryTxn::new(&self.store);
        for item in record.items.iter().filter(|i| i.kind == ItemKind::Ammunition) {
            inventory.reserve(&item.target, location, item.quantity)?;
        }

        let before = record.snapshot_value()?;
        record.status = CustodyStatus::Approved;
        record.supervisor = Some(supervisor.id.clone());
        record.approved_at = Some(TimeStamp::new());

        let mut batch = Batch::default();
        inventory.stage(&mut batch)?;
        self.store.stage_record(&mut batch, &record)?;
        self.ledger.stage_event(
            &mut batch,
            Some(supervisor.id.as_str()),
            TargetRef::custody(&record.id),
            EventKind::Aprovar,
            "custody record approved",
            Some(before),
            Some(record.snapshot_value()?),
        )?;
        self.store.apply(batch)?;

        tracing::info!(record = %record.id, supervisor = %supervisor.id, "custody approved");
        Ok(record)
    }

    /// Hand the approved items over and open the custody.
    ///
    /// Lot-targeted ammunition consumes its reservation; asset-targeted
    /// ammunition was already debited at approval.
    pub fn deliver_custody(
        &self,
        record_id: &str,
        custodian: &Actor,
        checklist: Option<serde_json::Value>,
    ) -> Result<CustodyRecord, CustodyError> {
        let _guard = self.lock();

        let mut record = self.load(record_id)?;
        if record.status != CustodyStatus::Approved {
            return Err(CustodyError::Precondition(
                "only approved custody records can be delivered".to_string(),
            ));
        }
        policy::check_dual_control(
            &self.config,
            &record.requester.id,
            &custodian.id,
            "segregation of duty: the requester cannot take delivery of their own custody",
        )?;
        policy::check_time_window(
            &self.config.withdrawal_window,
            custodian,
            &self.config.window_override_capability,
            Local::now().time(),
            "delivery",
        )?;

        let (weapons, _ammunition) = self.resolve_views(&record)?;
        policy::check_maintenance_clear(&weapons)?;

        let mut inventory = InventoryTxn::new(&self.store);
        for item in record.items.iter().filter(|i| i.kind == ItemKind::Ammunition) {
            inventory.consume_reserved(&item.target, DEFAULT_LOCATION, item.quantity)?;
        }

        let before = record.snapshot_value()?;
        record.status = CustodyStatus::Open;
        record.custodian = Some(custodian.id.clone());
        record.withdrawn_at = Some(TimeStamp::new());
        if let Some(checklist) = &checklist {
            record.append_note("DELIVERY_CHECKLIST", checklist)?;
        }

        let mut batch = Batch::default();
        inventory.stage(&mut batch)?;
        self.store.stage_record(&mut batch, &record)?;
        self.ledger.stage_event(
            &mut batch,
            Some(custodian.id.as_str()),
            TargetRef::custody(&record.id),
            EventKind::Entregar,
            "custody record delivered and opened",
            Some(before),
            Some(record.snapshot_value()?),
        )?;
        self.store.apply(batch)?;

        tracing::info!(record = %record.id, custodian = %custodian.id, "custody delivered");
        Ok(record)
    }

    /// Receive the items back and close the custody.
    ///
    /// From `Open`, an optional returned-ammunition map credits stock back.
    /// From `Approved` (never delivered), every reservation is reversed in
    /// full.
    pub fn return_custody(
        &self,
        record_id: &str,
        custodian: &Actor,
        checklist: Option<serde_json::Value>,
        returned_ammunition: Option<&BTreeMap<String, u32>>,
        location: Option<&str>,
        supervisor: Option<&Actor>,
    ) -> Result<CustodyRecord, CustodyError> {
        let _guard = self.lock();
        let location = location.unwrap_or(DEFAULT_LOCATION);

        let mut record = self.load(record_id)?;
        if record.status != CustodyStatus::Open && record.status != CustodyStatus::Approved {
            return Err(CustodyError::Precondition(
                "only open or approved custody records can be returned".to_string(),
            ));
        }
        policy::check_time_window(
            &self.config.return_window,
            custodian,
            &self.config.window_override_capability,
            Local::now().time(),
            "return",
        )?;
        policy::check_designated_supervisor(
            record.supervisor.as_deref(),
            supervisor.map(|s| s.id.as_str()),
        )?;

        let mut inventory = InventoryTxn::new(&self.store);
        if record.status == CustodyStatus::Open {
            if let Some(returned) = returned_ammunition {
                for (target_id, quantity) in returned {
                    if *quantity == 0 {
                        continue;
                    }
                    inventory.restock(target_id, location, *quantity)?;
                }
            }
        } else {
            // never delivered: undo the approval-time reservation in full
            for item in record.items.iter().filter(|i| i.kind == ItemKind::Ammunition) {
                inventory.release_reservation(&item.target, location, item.quantity)?;
            }
        }

        let before = record.snapshot_value()?;
        record.status = CustodyStatus::Closed;
        record.returned_at = Some(TimeStamp::new());
        if let Some(checklist) = &checklist {
            record.append_note("RETURN_CHECKLIST", checklist)?;
        }

        let mut batch = Batch::default();
        inventory.stage(&mut batch)?;
        self.store.stage_record(&mut batch, &record)?;
        self.ledger.stage_event(
            &mut batch,
            Some(custodian.id.as_str()),
            TargetRef::custody(&record.id),
            EventKind::Devolver,
            "custody record closed",
            Some(before),
            Some(record.snapshot_value()?),
        )?;
        self.store.apply(batch)?;

        tracing::info!(record = %record.id, custodian = %custodian.id, "custody returned");
        Ok(record)
    }
}

/// Working set for one operation's inventory mutations. Rows load through
/// the store once and mutate in place, so repeated targets within one
/// record accumulate instead of clobbering each other; nothing touches the
/// keyspace until `stage` hands the rows to the operation's batch.
struct InventoryTxn<'a> {
    store: &'a Store,
    stocks: BTreeMap<String, AmmunitionStock>,
    assets: BTreeMap<String, FixedAsset>,
}

impl<'a> InventoryTxn<'a> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            stocks: BTreeMap::new(),
            assets: BTreeMap::new(),
        }
    }

    fn stock_entry(
        &mut self,
        lot_id: &str,
        location: &str,
    ) -> Result<&mut AmmunitionStock, CustodyError> {
        let key = format!("{lot_id}/{location}");
        match self.stocks.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let stock = self
                    .store
                    .get_stock(lot_id, location)?
                    .unwrap_or_else(|| AmmunitionStock::empty(lot_id, location));
                Ok(entry.insert(stock))
            }
        }
    }

    fn asset_entry(&mut self, asset_id: &str) -> Result<&mut FixedAsset, CustodyError> {
        match self.assets.entry(asset_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let asset = self.store.get_asset(asset_id)?.ok_or_else(|| {
                    CustodyError::NotFound(format!("asset {asset_id} not found"))
                })?;
                Ok(entry.insert(asset))
            }
        }
    }

    /// Approval: move units from available to reserved (lots) or debit the
    /// asset quantity directly.
    fn reserve(
        &mut self,
        target: &ItemTarget,
        location: &str,
        quantity: u32,
    ) -> Result<(), CustodyError> {
        match target {
            ItemTarget::Lot(id) => {
                let stock = self.stock_entry(id, location)?;
                if stock.available < quantity {
                    return Err(CustodyError::InsufficientStock(format!(
                        "insufficient stock for lot {id} at approval"
                    )));
                }
                stock.available -= quantity;
                stock.reserved += quantity;
            }
            ItemTarget::Asset(id) => {
                let asset = self.asset_entry(id)?;
                if asset.quantity < quantity {
                    return Err(CustodyError::InsufficientStock(format!(
                        "insufficient stock for asset {id} at approval"
                    )));
                }
                asset.quantity -= quantity;
            }
        }
        Ok(())
    }

    /// Delivery: the reservation is consumed; asset-targeted ammunition was
    /// debited at approval and needs nothing here.
    fn consume_reserved(
        &mut self,
        target: &ItemTarget,
        location: &str,
        quantity: u32,
    ) -> Result<(), CustodyError> {
        match target {
            ItemTarget::Lot(id) => {
                let stock = self.stock_entry(id, location)?;
                if stock.reserved < quantity {
                    return Err(CustodyError::InsufficientStock(format!(
                        "insufficient reserve for lot {id} at delivery"
                    )));
                }
                stock.reserved -= quantity;
            }
            ItemTarget::Asset(_) => {}
        }
        Ok(())
    }

    /// Return of issued ammunition: credit available (lots) or the asset
    /// quantity, trying the lot table first like the request path does.
    fn restock(
        &mut self,
        target_id: &str,
        location: &str,
        quantity: u32,
    ) -> Result<(), CustodyError> {
        if self.store.get_lot(target_id)?.is_some() {
            let stock = self.stock_entry(target_id, location)?;
            stock.available += quantity;
            return Ok(());
        }
        let asset = self.asset_entry(target_id)?;
        asset.quantity += quantity;
        Ok(())
    }

    /// Reversal of an undelivered approval. The lot path is clamped at the
    /// row's current reserve instead of failing; the clamp is logged so a
    /// prior consistency problem does not get corrected silently.
    fn release_reservation(
        &mut self,
        target: &ItemTarget,
        location: &str,
        quantity: u32,
    ) -> Result<(), CustodyError> {
        match target {
            ItemTarget::Lot(id) => {
                let stock = self.stock_entry(id, location)?;
                let released = quantity.min(stock.reserved);
                if released < quantity {
                    tracing::warn!(
                        lot = %id,
                        location = %location,
                        requested = quantity,
                        reserved = stock.reserved,
                        "reservation reversal clamped to current reserve"
                    );
                }
                stock.reserved -= released;
                stock.available += released;
            }
            ItemTarget::Asset(id) => {
                let asset = self.asset_entry(id)?;
                asset.quantity += quantity;
            }
        }
        Ok(())
    }

    fn stage(self, batch: &mut Batch) -> Result<(), CustodyError> {
        for stock in self.stocks.values() {
            self.store.stage_stock(batch, stock)?;
        }
        for asset in self.assets.values() {
            self.store.stage_asset(batch, asset)?;
        }
        Ok(())
    }
}
