/*!
    subscription evaluator

    node-side automation rules: when every condition of a subscription holds
    at once, its actions write the configured values into registers. firing
    is edge-triggered: once per transition into the fully-fulfilled state,
    not on every pass while it stays fulfilled.

    the evaluator is the consumer of the register store's dirty marks, so it
    only re-checks conditions whose register actually changed.
*/

use heapless::Vec;
use log::*;

use crate::config::*;
use crate::registers::{RegisterKind, RegisterStore};
use crate::value::Value;


/// one register-equality condition
#[derive(Clone, Debug)]
pub struct Condition {
    pub kind: RegisterKind,
    pub index: u8,
    pub expected: Value,
    fulfilled: bool,
}

/// one register write applied when a subscription fires
#[derive(Clone, Debug)]
pub struct Action {
    pub kind: RegisterKind,
    pub index: u8,
    pub value: Value,
}

/// a rule: all conditions fulfilled at once → apply all actions
#[derive(Clone, Debug)]
pub struct Subscription {
    pub key: u8,
    conditions: Vec<Condition, MAX_CONDITIONS>,
    actions: Vec<Action, MAX_ACTIONS>,
    /// currently in the fully-fulfilled state (edge detection)
    active: bool,
}

impl Subscription {
    pub fn new(key: u8) -> Self {
        Self { key, conditions: Vec::new(), actions: Vec::new(), active: false }
    }

    pub fn condition(mut self, kind: RegisterKind, index: u8, expected: Value)
        -> Result<Self, &'static str>
    {
        let condition = Condition { kind, index, expected, fulfilled: false };
        if self.conditions.push(condition).is_err() {
            return Err("too many conditions for subscription");
        }
        Ok(self)
    }

    pub fn action(mut self, kind: RegisterKind, index: u8, value: Value)
        -> Result<Self, &'static str>
    {
        if self.actions.push(Action { kind, index, value }).is_err() {
            return Err("too many actions for subscription");
        }
        Ok(self)
    }

    fn fulfilled(&self) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.fulfilled)
    }
}

/// all subscriptions of the node
#[derive(Default)]
pub struct Subscriptions {
    subscriptions: Vec<Subscription, MAX_SUBSCRIPTIONS>,
    /// scratch buffer for one drain of dirty marks
    dirty: Vec<(RegisterKind, u8), 16>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a subscription, evaluating its conditions against the
    /// current register values
    ///
    /// a subscription that is already fulfilled when added does not fire:
    /// actions run on the next transition into the fulfilled state
    pub fn add(&mut self, mut subscription: Subscription, store: &RegisterStore)
        -> Result<u8, &'static str>
    {
        for condition in &mut subscription.conditions {
            condition.fulfilled =
                store.read(condition.kind, condition.index) == Ok(condition.expected);
        }
        subscription.active = subscription.fulfilled();
        if self.subscriptions.push(subscription).is_err() {
            return Err("too many subscriptions");
        }
        Ok(self.subscriptions.len() as u8 - 1)
    }

    /// drain dirty registers and fire any subscription that just became
    /// fully fulfilled
    pub fn run(&mut self, store: &mut RegisterStore) {
        self.dirty.clear();
        store.drain_dirty(&mut self.dirty);
        if self.dirty.is_empty() {
            return;
        }
        for subscription in &mut self.subscriptions {
            for condition in &mut subscription.conditions {
                if self.dirty.iter().any(|&(kind, index)| {
                    kind == condition.kind && index == condition.index
                }) {
                    condition.fulfilled =
                        store.read(condition.kind, condition.index) == Ok(condition.expected);
                }
            }
            let fulfilled = subscription.fulfilled();
            if fulfilled && !subscription.active {
                debug!("subscription {} fires", subscription.key);
                for action in &subscription.actions {
                    if let Err(error) = store.write(action.kind, action.index, action.value) {
                        warn!(
                            "subscription {} action on register {} failed: {}",
                            subscription.key, action.index, error,
                        );
                    }
                }
            }
            subscription.active = fulfilled;
        }
    }
}
