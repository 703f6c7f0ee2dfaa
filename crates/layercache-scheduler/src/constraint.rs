//! Runtime preconditions a job waits on before it may run.
//!
//! The host publishes a [`Conditions`] snapshot through [`HostConditions`];
//! every waiting job holds a `watch` receiver and re-evaluates its
//! [`ConstraintSet`] whenever the snapshot changes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use layercache_core::config::ConditionsConfig;

/// One precondition, named after the host platform's job constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    Network,
    DeviceIdle,
    Charging,
    BatteryNotLow,
    StorageNotLow,
}

impl Constraint {
    pub fn holds(self, conditions: &Conditions) -> bool {
        match self {
            Constraint::Network => conditions.network,
            Constraint::DeviceIdle => conditions.device_idle,
            Constraint::Charging => conditions.charging,
            Constraint::BatteryNotLow => conditions.battery_not_low,
            Constraint::StorageNotLow => conditions.storage_not_low,
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Constraint::Network => "network",
            Constraint::DeviceIdle => "device_idle",
            Constraint::Charging => "charging",
            Constraint::BatteryNotLow => "battery_not_low",
            Constraint::StorageNotLow => "storage_not_low",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Constraint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            "network" => Ok(Constraint::Network),
            "device_idle" => Ok(Constraint::DeviceIdle),
            "charging" => Ok(Constraint::Charging),
            "battery_not_low" => Ok(Constraint::BatteryNotLow),
            "storage_not_low" => Ok(Constraint::StorageNotLow),
            other => Err(format!("unknown constraint: {other}")),
        }
    }
}

/// The constraints attached to a job. Empty means "always satisfied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintSet(BTreeSet<Constraint>);

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, constraint: Constraint) -> Self {
        self.0.insert(constraint);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn satisfied_by(&self, conditions: &Conditions) -> bool {
        self.0.iter().all(|c| c.holds(conditions))
    }

    /// Constraints that do not hold under `conditions`, in stable order.
    pub fn missing(&self, conditions: &Conditions) -> Vec<Constraint> {
        self.0.iter().copied().filter(|c| !c.holds(conditions)).collect()
    }
}

impl FromIterator<Constraint> for ConstraintSet {
    fn from_iter<I: IntoIterator<Item = Constraint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Snapshot of host platform state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    pub network: bool,
    pub device_idle: bool,
    pub charging: bool,
    pub battery_not_low: bool,
    pub storage_not_low: bool,
}

impl Conditions {
    pub fn all_satisfied() -> Self {
        Self {
            network: true,
            device_idle: true,
            charging: true,
            battery_not_low: true,
            storage_not_low: true,
        }
    }

    pub fn none_satisfied() -> Self {
        Self {
            network: false,
            device_idle: false,
            charging: false,
            battery_not_low: false,
            storage_not_low: false,
        }
    }
}

impl Default for Conditions {
    fn default() -> Self {
        Self::all_satisfied()
    }
}

impl From<&ConditionsConfig> for Conditions {
    fn from(cfg: &ConditionsConfig) -> Self {
        Self {
            network: cfg.network,
            device_idle: cfg.device_idle,
            charging: cfg.charging,
            battery_not_low: cfg.battery_not_low,
            storage_not_low: cfg.storage_not_low,
        }
    }
}

/// Publisher side of the condition feed, owned by the host.
///
/// Dropping it freezes the last snapshot: jobs whose constraints already
/// hold still run, jobs still waiting fail with `ConstraintsUnmet`.
#[derive(Debug)]
pub struct HostConditions {
    tx: watch::Sender<Conditions>,
}

impl HostConditions {
    pub fn new(initial: Conditions) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Conditions> {
        self.tx.subscribe()
    }

    /// Replace the whole snapshot. Waiters are only woken on an actual change.
    pub fn set(&self, conditions: Conditions) {
        self.tx.send_if_modified(|current| {
            if *current == conditions {
                return false;
            }
            *current = conditions;
            true
        });
    }

    /// Mutate the snapshot in place, e.g. `update(|c| c.network = false)`.
    pub fn update(&self, f: impl FnOnce(&mut Conditions)) {
        self.tx.send_if_modified(|current| {
            let before = *current;
            f(current);
            *current != before
        });
    }
}

impl Default for HostConditions {
    fn default() -> Self {
        Self::new(Conditions::default())
    }
}

/// The condition feed closed while constraints were still unmet.
#[derive(Debug)]
pub(crate) struct ConditionsClosed;

/// Resolve once `constraints` hold under the latest snapshot.
pub(crate) async fn wait_until_satisfied(
    rx: &mut watch::Receiver<Conditions>,
    constraints: &ConstraintSet,
) -> std::result::Result<(), ConditionsClosed> {
    if constraints.is_empty() {
        return Ok(());
    }
    rx.wait_for(|c| constraints.satisfied_by(c))
        .await
        .map(|_| ())
        .map_err(|_| ConditionsClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_set_is_always_satisfied() {
        assert!(ConstraintSet::new().satisfied_by(&Conditions::none_satisfied()));
    }

    #[test]
    fn missing_lists_only_unmet_constraints() {
        let set = ConstraintSet::new()
            .with(Constraint::Network)
            .with(Constraint::Charging);
        let mut cond = Conditions::all_satisfied();
        cond.charging = false;
        assert!(!set.satisfied_by(&cond));
        assert_eq!(set.missing(&cond), vec![Constraint::Charging]);
    }

    #[test]
    fn parses_kebab_and_snake_names() {
        assert_eq!("device-idle".parse::<Constraint>().unwrap(), Constraint::DeviceIdle);
        assert_eq!("storage_not_low".parse::<Constraint>().unwrap(), Constraint::StorageNotLow);
        assert!("wifi".parse::<Constraint>().is_err());
    }

    #[test]
    fn set_serializes_as_list() {
        let set: ConstraintSet = [Constraint::Network, Constraint::DeviceIdle].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["network","device_idle"]"#);
    }

    #[tokio::test]
    async fn waiter_wakes_when_condition_flips() {
        let host = HostConditions::new(Conditions::none_satisfied());
        let mut rx = host.subscribe();
        let set = ConstraintSet::new().with(Constraint::Network);

        let waiter = tokio::spawn(async move { wait_until_satisfied(&mut rx, &set).await.is_ok() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        host.update(|c| c.network = true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn set_notifies_only_on_real_change() {
        let host = HostConditions::new(Conditions::all_satisfied());
        let mut rx = host.subscribe();
        rx.mark_unchanged();

        host.set(Conditions::all_satisfied());
        assert!(!rx.has_changed().unwrap());

        let mut offline = Conditions::all_satisfied();
        offline.network = false;
        host.set(offline);
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().network);

        let set = ConstraintSet::new().with(Constraint::Network);
        let waiter = tokio::spawn(async move { wait_until_satisfied(&mut rx, &set).await.is_ok() });
        host.set(offline);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        host.set(Conditions::all_satisfied());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn waiter_fails_when_host_goes_away() {
        let host = HostConditions::new(Conditions::none_satisfied());
        let mut rx = host.subscribe();
        drop(host);
        let set = ConstraintSet::new().with(Constraint::Charging);
        assert!(wait_until_satisfied(&mut rx, &set).await.is_err());
    }

    #[tokio::test]
    async fn already_satisfied_survives_closed_feed() {
        let host = HostConditions::new(Conditions::all_satisfied());
        let mut rx = host.subscribe();
        drop(host);
        let set = ConstraintSet::new().with(Constraint::Charging);
        assert!(wait_until_satisfied(&mut rx, &set).await.is_ok());
    }
}
