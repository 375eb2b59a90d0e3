//! Pure business-rule checks for custody transitions
//!
//! Every check is side-effect free and returns a typed failure with a
//! human-readable reason; the first failing check aborts the operation
//! before any mutation happens.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveTime;

use crate::custody::{Actor, ItemTarget, Party};
use crate::error::CustodyError;

/// Daily same-day window; never crosses midnight.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn full_day() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(23, 59, 59).expect("valid literal time"),
        }
    }

    /// Build a window from "HH:MM" strings. A malformed bound falls back to
    /// 00:00, which keeps the historical permissive behavior; the fallback
    /// is logged so misconfiguration stays visible.
    pub fn parse(start: &str, end: &str) -> Self {
        Self {
            start: parse_hhmm(start),
            end: parse_hhmm(end),
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t <= self.end
    }
}

fn parse_hhmm(value: &str) -> NaiveTime {
    match NaiveTime::parse_from_str(value, "%H:%M") {
        Ok(t) => t,
        Err(_) => {
            tracing::warn!(value, "malformed HH:MM window bound, falling back to 00:00");
            NaiveTime::MIN
        }
    }
}

#[derive(Debug, Clone)]
pub struct AmmoLimits {
    pub default_max: u64,
    pub by_role: BTreeMap<String, u64>,
    pub by_class: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub ammo_limits: AmmoLimits,
    pub dual_control: bool,
    pub withdrawal_window: TimeWindow,
    pub return_window: TimeWindow,
    pub window_override_capability: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ammo_limits: AmmoLimits {
                default_max: 1_000_000_000,
                by_role: BTreeMap::new(),
                by_class: BTreeMap::new(),
            },
            dual_control: false,
            withdrawal_window: TimeWindow::full_day(),
            return_window: TimeWindow::full_day(),
            window_override_capability: "armory.override_window".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn with_dual_control(mut self) -> Self {
        self.dual_control = true;
        self
    }
    pub fn with_role_limit(mut self, role: &str, max: u64) -> Self {
        self.ammo_limits.by_role.insert(role.to_string(), max);
        self
    }
    pub fn with_class_limit(mut self, class: &str, max: u64) -> Self {
        self.ammo_limits.by_class.insert(class.to_string(), max);
        self
    }
    pub fn with_windows(mut self, withdrawal: TimeWindow, ret: TimeWindow) -> Self {
        self.withdrawal_window = withdrawal;
        self.return_window = ret;
        self
    }

    /// Ceiling resolution: role override first, then class, then the
    /// default. An override configured as zero falls through to the default.
    pub fn ammo_limit_for(&self, role: Option<&str>, class: Option<&str>) -> u64 {
        if let Some(role) = role {
            if let Some(max) = self.ammo_limits.by_role.get(role) {
                return if *max == 0 {
                    self.ammo_limits.default_max
                } else {
                    *max
                };
            }
        }
        if let Some(class) = class {
            if let Some(max) = self.ammo_limits.by_class.get(class) {
                return if *max == 0 {
                    self.ammo_limits.default_max
                } else {
                    *max
                };
            }
        }
        self.ammo_limits.default_max
    }
}

/// A weapon line item resolved against the store.
#[derive(Debug, Clone)]
pub struct WeaponView {
    pub asset_id: String,
    pub calibre: String,
    pub in_maintenance: bool,
}

/// An ammunition line item resolved against the store.
#[derive(Debug, Clone)]
pub struct AmmoView {
    pub target: ItemTarget,
    pub calibre: String,
    pub quantity: u32,
}

pub fn normalized_calibre(calibre: &str) -> String {
    calibre.trim().to_uppercase()
}

/// When a record carries both weapons and ammunition, every ammunition
/// calibre must appear among the weapons' calibres.
pub fn check_calibre_compatibility(
    weapons: &[WeaponView],
    ammunition: &[AmmoView],
) -> Result<(), CustodyError> {
    if weapons.is_empty() || ammunition.is_empty() {
        return Ok(());
    }
    let weapon_calibres: BTreeSet<&str> = weapons
        .iter()
        .map(|w| w.calibre.as_str())
        .filter(|c| !c.is_empty())
        .collect();
    let incompatible = weapon_calibres.is_empty()
        || ammunition
            .iter()
            .any(|a| !weapon_calibres.contains(a.calibre.as_str()));
    if incompatible {
        return Err(CustodyError::Policy(
            "ammunition calibre is not compatible with the requested weapons".to_string(),
        ));
    }
    Ok(())
}

pub fn check_ammo_ceiling(
    config: &PolicyConfig,
    requester: &Party,
    total_ammunition: u64,
) -> Result<(), CustodyError> {
    let limit = config.ammo_limit_for(requester.role.as_deref(), requester.class.as_deref());
    if total_ammunition > limit {
        return Err(CustodyError::Policy(format!(
            "total ammunition requested ({total_ammunition}) exceeds the limit ({limit}) for the requester profile"
        )));
    }
    Ok(())
}

pub fn check_dual_control(
    config: &PolicyConfig,
    requester_id: &str,
    actor_id: &str,
    violation: &str,
) -> Result<(), CustodyError> {
    if config.dual_control && requester_id == actor_id {
        return Err(CustodyError::Policy(violation.to_string()));
    }
    Ok(())
}

pub fn check_time_window(
    window: &TimeWindow,
    actor: &Actor,
    override_capability: &str,
    now: NaiveTime,
    action: &str,
) -> Result<(), CustodyError> {
    if window.contains(now) || actor.has_capability(override_capability) {
        return Ok(());
    }
    Err(CustodyError::Policy(format!(
        "{action} outside the permitted time window"
    )))
}

pub fn check_maintenance_clear(weapons: &[WeaponView]) -> Result<(), CustodyError> {
    if weapons.iter().any(|w| w.in_maintenance) {
        return Err(CustodyError::Policy(
            "weapon under maintenance with availability impact; delivery blocked".to_string(),
        ));
    }
    Ok(())
}

/// A return must be countersigned by the record's designated supervisor
/// when one exists and a supervisor is acting.
pub fn check_designated_supervisor(
    designated: Option<&str>,
    acting: Option<&str>,
) -> Result<(), CustodyError> {
    if let (Some(designated), Some(acting)) = (designated, acting) {
        if designated != acting {
            return Err(CustodyError::Policy(
                "only the designated supervisor may approve the return".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weapon(calibre: &str) -> WeaponView {
        WeaponView {
            asset_id: "asset_1abc".to_string(),
            calibre: normalized_calibre(calibre),
            in_maintenance: false,
        }
    }

    fn ammo(calibre: &str, quantity: u32) -> AmmoView {
        AmmoView {
            target: ItemTarget::Lot("lot_1abc".to_string()),
            calibre: normalized_calibre(calibre),
            quantity,
        }
    }

    #[test]
    fn malformed_window_bound_falls_back_to_midnight() {
        let window = TimeWindow::parse("not-a-time", "18:00");
        assert_eq!(window.start, NaiveTime::MIN);
        assert_eq!(window.end, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
    }

    #[test]
    fn window_contains_is_inclusive_on_both_bounds() {
        let window = TimeWindow::parse("08:00", "18:00");
        assert!(window.contains(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(18, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(7, 59, 59).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(18, 0, 1).unwrap()));
    }

    #[test]
    fn matching_calibres_pass() {
        let weapons = vec![weapon("9mm")];
        let ammunition = vec![ammo(" 9MM ", 30)];
        assert!(check_calibre_compatibility(&weapons, &ammunition).is_ok());
    }

    #[test]
    fn mismatched_calibre_fails() {
        let weapons = vec![weapon("9mm")];
        let ammunition = vec![ammo(".40", 30)];
        assert!(matches!(
            check_calibre_compatibility(&weapons, &ammunition),
            Err(CustodyError::Policy(_))
        ));
    }

    #[test]
    fn blank_weapon_calibres_fail_when_ammunition_present() {
        let weapons = vec![weapon("")];
        let ammunition = vec![ammo("9mm", 30)];
        assert!(check_calibre_compatibility(&weapons, &ammunition).is_err());
    }

    #[test]
    fn ammunition_without_weapons_passes() {
        let ammunition = vec![ammo("9mm", 30)];
        assert!(check_calibre_compatibility(&[], &ammunition).is_ok());
    }

    #[test]
    fn ceiling_prefers_role_then_class_then_default() {
        let config = PolicyConfig::default()
            .with_role_limit("patrol", 50)
            .with_class_limit("second", 80);

        assert_eq!(config.ammo_limit_for(Some("patrol"), Some("second")), 50);
        assert_eq!(config.ammo_limit_for(Some("unknown"), Some("second")), 80);
        assert_eq!(
            config.ammo_limit_for(None, None),
            config.ammo_limits.default_max
        );
    }

    #[test]
    fn zero_override_falls_through_to_default() {
        let config = PolicyConfig::default().with_role_limit("patrol", 0);
        assert_eq!(
            config.ammo_limit_for(Some("patrol"), None),
            config.ammo_limits.default_max
        );
    }

    #[test]
    fn dual_control_blocks_self_approval_only_when_enabled() {
        let relaxed = PolicyConfig::default();
        assert!(check_dual_control(&relaxed, "user_1", "user_1", "nope").is_ok());

        let strict = PolicyConfig::default().with_dual_control();
        assert!(check_dual_control(&strict, "user_1", "user_1", "nope").is_err());
        assert!(check_dual_control(&strict, "user_1", "user_2", "nope").is_ok());
    }

    #[test]
    fn override_capability_bypasses_window() {
        let window = TimeWindow::parse("08:00", "09:00");
        let outside = NaiveTime::from_hms_opt(22, 0, 0).unwrap();

        let plain = Actor::new("user_1");
        assert!(check_time_window(&window, &plain, "armory.override_window", outside, "delivery")
            .is_err());

        let privileged = Actor::new("user_1").with_capability("armory.override_window");
        assert!(
            check_time_window(&window, &privileged, "armory.override_window", outside, "delivery")
                .is_ok()
        );
    }

    #[test]
    fn designated_supervisor_must_match() {
        assert!(check_designated_supervisor(Some("user_1"), Some("user_1")).is_ok());
        assert!(check_designated_supervisor(Some("user_1"), Some("user_2")).is_err());
        assert!(check_designated_supervisor(Some("user_1"), None).is_ok());
        assert!(check_designated_supervisor(None, Some("user_2")).is_ok());
    }
}
