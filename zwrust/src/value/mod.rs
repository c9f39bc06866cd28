//! Device state cache
//!
//! A [`Value`] holds the last confirmed reading of one device property and
//! reconciles new readings with it. Devices occasionally report transient or
//! duplicated states, so a reading that differs from the cached one is not
//! trusted until a second read agrees:
//!
//! | state                | reading              | result                       |
//! |----------------------|----------------------|------------------------------|
//! | never set            | any                  | accept, `Changed`            |
//! | verification off     | any                  | accept, `Changed`            |
//! | `Stable`             | equal to current     | `Refreshed`                  |
//! | `Stable`             | differs              | `Checking`, read again       |
//! | `Checking(c)`        | equal to `c`         | commit, `Changed`            |
//! | `Checking(c)`        | equal to current     | back to `Stable`, `Refreshed`|
//! | `Checking(c)`        | a third value        | `Checking(new)`, read again  |

mod store;

pub use store::ValueStore;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

use zwrust_types::{ValueGenre, ValueId, ValueType};

use crate::error::{Error, Result};

/// Typed content of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueData {
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    /// Decimal kept as its reported text, e.g. `"21.50"`
    Decimal(String),
    /// Index of the selected list item
    List(i32),
    String(String),
    /// Pressed state of a write-only button
    Button(bool),
    Raw(Vec<u8>),
}

impl ValueData {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Byte(_) => ValueType::Byte,
            Self::Short(_) => ValueType::Short,
            Self::Int(_) => ValueType::Int,
            Self::Decimal(_) => ValueType::Decimal,
            Self::List(_) => ValueType::List,
            Self::String(_) => ValueType::String,
            Self::Button(_) => ValueType::Button,
            Self::Raw(_) => ValueType::Raw,
        }
    }

    /// Default content for a value type
    pub fn default_for(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Bool => Self::Bool(false),
            ValueType::Byte => Self::Byte(0),
            ValueType::Short => Self::Short(0),
            ValueType::Int => Self::Int(0),
            ValueType::Decimal => Self::Decimal("0".to_string()),
            ValueType::List => Self::List(0),
            ValueType::String => Self::String(String::new()),
            ValueType::Button => Self::Button(false),
            ValueType::Raw => Self::Raw(Vec::new()),
        }
    }

    /// Numeric content, for range checks and wire encoding
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Bool(b) | Self::Button(b) => Some(b as i64),
            Self::Byte(v) => Some(v as i64),
            Self::Short(v) => Some(v as i64),
            Self::Int(v) | Self::List(v) => Some(v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for ValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) | Self::Button(v) => write!(f, "{}", v),
            Self::Byte(v) => write!(f, "{}", v),
            Self::Short(v) => write!(f, "{}", v),
            Self::Int(v) | Self::List(v) => write!(f, "{}", v),
            Self::Decimal(v) | Self::String(v) => f.write_str(v),
            Self::Raw(v) => f.write_str(&hex::encode(v)),
        }
    }
}

/// Which values a write-only value touches
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Affects {
    #[default]
    Nothing,
    /// Indices of values of the same command class and instance
    Indices(Vec<u8>),
    /// Every configuration value of the node
    All,
}

/// Entry of a list value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub label: String,
    pub value: i32,
}

/// Result of feeding a reading into [`Value::on_value_refreshed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cache now holds a new confirmed reading
    Changed,
    /// Reading confirmed the cached state
    Refreshed,
    /// Reading is unconfirmed; the device must be read again
    Verifying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verification {
    Stable,
    Checking { candidate: ValueData },
}

#[derive(Debug)]
struct ValueState {
    current: ValueData,
    is_set: bool,
    verification: Verification,
    poll_intensity: u8,
    refreshed_at: Option<DateTime<Utc>>,
}

/// One observable property of a node
///
/// Metadata is fixed at creation; the cached reading sits behind a lock so
/// values can be shared (`Arc<Value>`) with notifications in flight.
pub struct Value {
    id: ValueId,
    label: String,
    units: String,
    help: String,
    read_only: bool,
    write_only: bool,
    verify_changes: bool,
    min: i64,
    max: i64,
    affects: Affects,
    items: Vec<ListItem>,
    state: Mutex<ValueState>,
}

impl Value {
    /// Create a value holding the type's default content
    ///
    /// Change verification is on unless disabled with
    /// [`with_verify_changes`](Self::with_verify_changes).
    pub fn new(id: ValueId, label: impl Into<String>) -> Self {
        let (min, max) = default_range(id.value_type);
        Self {
            id,
            label: label.into(),
            units: String::new(),
            help: String::new(),
            read_only: false,
            write_only: false,
            verify_changes: true,
            min,
            max,
            affects: Affects::Nothing,
            items: Vec::new(),
            state: Mutex::new(ValueState {
                current: ValueData::default_for(id.value_type),
                is_set: false,
                verification: Verification::Stable,
                poll_intensity: 0,
                refreshed_at: None,
            }),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.write_only = false;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.write_only = true;
        self.read_only = false;
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_affects(mut self, affects: Affects) -> Self {
        self.affects = affects;
        self
    }

    pub fn with_verify_changes(mut self, verify: bool) -> Self {
        self.verify_changes = verify;
        self
    }

    pub fn with_items(mut self, items: Vec<ListItem>) -> Self {
        self.items = items;
        self
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only
    }

    pub fn verifies_changes(&self) -> bool {
        self.verify_changes
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn affects(&self) -> &Affects {
        &self.affects
    }

    pub fn items(&self) -> &[ListItem] {
        &self.items
    }

    pub fn genre(&self) -> ValueGenre {
        self.id.genre
    }

    /// Cached reading
    pub fn data(&self) -> ValueData {
        self.state.lock().current.clone()
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().is_set
    }

    /// Whether an unconfirmed reading is being verified
    pub fn is_checking_change(&self) -> bool {
        matches!(self.state.lock().verification, Verification::Checking { .. })
    }

    pub fn poll_intensity(&self) -> u8 {
        self.state.lock().poll_intensity
    }

    /// Poll every `intensity` rounds; 0 disables polling
    pub fn set_poll_intensity(&self, intensity: u8) {
        self.state.lock().poll_intensity = intensity;
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().refreshed_at
    }

    /// Check that `data` may be sent to the device
    pub fn check_set(&self, data: &ValueData) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyValue(self.id));
        }
        self.check_type(data)?;
        if let Some(v) = data.as_i64() {
            if v < self.min || v > self.max {
                return Err(Error::OutOfRange {
                    id: self.id,
                    detail: format!("{} not in {}..={}", v, self.min, self.max),
                });
            }
        }
        if let ValueData::List(v) = data {
            if !self.items.is_empty() && !self.items.iter().any(|item| item.value == *v) {
                return Err(Error::OutOfRange {
                    id: self.id,
                    detail: format!("{} is not a list item", v),
                });
            }
        }
        Ok(())
    }

    fn check_type(&self, data: &ValueData) -> Result<()> {
        let actual = data.value_type();
        if actual != self.id.value_type {
            return Err(Error::TypeMismatch {
                id: self.id,
                expected: self.id.value_type,
                actual,
            });
        }
        Ok(())
    }

    /// Reconcile a reading reported by the device with the cache
    ///
    /// The caller turns the outcome into notifications and, for
    /// [`RefreshOutcome::Verifying`], requests the value again.
    pub fn on_value_refreshed(&self, reading: ValueData) -> Result<RefreshOutcome> {
        self.check_type(&reading)?;

        let mut state = self.state.lock();
        state.refreshed_at = Some(Utc::now());

        if !state.is_set {
            trace!(value = %self.id, %reading, "Initial read of value");
            state.current = reading;
            state.is_set = true;
            state.verification = Verification::Stable;
            return Ok(RefreshOutcome::Changed);
        }

        if !self.verify_changes {
            state.current = reading;
            state.verification = Verification::Stable;
            return Ok(RefreshOutcome::Changed);
        }

        let previous = std::mem::replace(&mut state.verification, Verification::Stable);
        let outcome = match previous {
            Verification::Stable if reading == state.current => RefreshOutcome::Refreshed,
            Verification::Stable => {
                debug!(value = %self.id, old = %state.current, new = %reading, "Value changed, verifying");
                state.verification = Verification::Checking { candidate: reading };
                RefreshOutcome::Verifying
            }
            Verification::Checking { candidate } if reading == candidate => {
                debug!(value = %self.id, new = %reading, "Change confirmed");
                state.current = reading;
                RefreshOutcome::Changed
            }
            Verification::Checking { .. } if reading == state.current => {
                debug!(value = %self.id, "Spurious change discarded");
                RefreshOutcome::Refreshed
            }
            Verification::Checking { candidate } => {
                debug!(value = %self.id, old = %candidate, new = %reading, "Value still changing");
                state.verification = Verification::Checking { candidate: reading };
                RefreshOutcome::Verifying
            }
        };

        Ok(outcome)
    }
}

fn default_range(value_type: ValueType) -> (i64, i64) {
    match value_type {
        ValueType::Bool | ValueType::Button => (0, 1),
        ValueType::Byte => (0, u8::MAX as i64),
        ValueType::Short => (i16::MIN as i64, i16::MAX as i64),
        ValueType::Int | ValueType::List => (i32::MIN as i64, i32::MAX as i64),
        _ => (0, 0),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Value")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("current", &state.current)
            .field("is_set", &state.is_set)
            .field("verification", &state.verification)
            .finish()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.label, self.data())?;
        if !self.units.is_empty() {
            write!(f, " {}", self.units)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn level() -> Value {
        let id = ValueId::new(0xC0FFEE, 4, ValueGenre::User, 0x26, 1, 0, ValueType::Byte).unwrap();
        Value::new(id, "Level")
    }

    fn refresh_all(value: &Value, readings: &[u8]) -> Vec<RefreshOutcome> {
        readings
            .iter()
            .map(|r| value.on_value_refreshed(ValueData::Byte(*r)).unwrap())
            .collect()
    }

    #[test]
    fn test_initial_read_is_change() {
        let value = level();
        assert!(!value.is_set());

        assert_eq!(refresh_all(&value, &[5]), vec![RefreshOutcome::Changed]);
        assert!(value.is_set());
        assert_eq!(value.data(), ValueData::Byte(5));
        assert!(value.refreshed_at().is_some());
    }

    #[test]
    fn test_same_reading_refreshes() {
        let value = level();
        refresh_all(&value, &[5]);

        assert_eq!(refresh_all(&value, &[5]), vec![RefreshOutcome::Refreshed]);
        assert_eq!(value.data(), ValueData::Byte(5));
    }

    #[test]
    fn test_change_needs_two_reads() {
        let value = level();
        refresh_all(&value, &[5]);

        assert_eq!(refresh_all(&value, &[7]), vec![RefreshOutcome::Verifying]);
        assert_eq!(value.data(), ValueData::Byte(5));
        assert!(value.is_checking_change());

        assert_eq!(refresh_all(&value, &[7]), vec![RefreshOutcome::Changed]);
        assert_eq!(value.data(), ValueData::Byte(7));
        assert!(!value.is_checking_change());
    }

    #[test]
    fn test_spurious_change_discarded() {
        let value = level();
        refresh_all(&value, &[5]);

        let outcomes = refresh_all(&value, &[7, 5]);
        assert_eq!(outcomes, vec![RefreshOutcome::Verifying, RefreshOutcome::Refreshed]);
        assert_eq!(value.data(), ValueData::Byte(5));
        assert!(!value.is_checking_change());
    }

    #[test]
    fn test_third_value_keeps_checking() {
        let value = level();
        refresh_all(&value, &[5]);

        let outcomes = refresh_all(&value, &[7, 9, 11, 11]);
        assert_eq!(
            outcomes,
            vec![
                RefreshOutcome::Verifying,
                RefreshOutcome::Verifying,
                RefreshOutcome::Verifying,
                RefreshOutcome::Changed,
            ]
        );
        assert_eq!(value.data(), ValueData::Byte(11));
    }

    #[test]
    fn test_unverified_value_always_changes() {
        let value = level().with_verify_changes(false);
        let outcomes = refresh_all(&value, &[5, 5, 7]);

        assert_eq!(outcomes, vec![RefreshOutcome::Changed; 3]);
        assert_eq!(value.data(), ValueData::Byte(7));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let value = level();
        assert!(matches!(
            value.on_value_refreshed(ValueData::Bool(true)),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(!value.is_set());
    }

    #[test]
    fn test_check_set() {
        let value = level().with_range(0, 99);
        assert!(value.check_set(&ValueData::Byte(99)).is_ok());
        assert!(matches!(value.check_set(&ValueData::Byte(100)), Err(Error::OutOfRange { .. })));

        let sensor = level().read_only();
        assert!(matches!(sensor.check_set(&ValueData::Byte(1)), Err(Error::ReadOnlyValue(_))));
    }

    #[test]
    fn test_list_items() {
        let id = ValueId::new(1, 4, ValueGenre::Config, 0x70, 1, 3, ValueType::List).unwrap();
        let value = Value::new(id, "Mode").with_items(vec![
            ListItem { label: "Off".into(), value: 0 },
            ListItem { label: "Auto".into(), value: 2 },
        ]);

        assert!(value.check_set(&ValueData::List(2)).is_ok());
        assert!(value.check_set(&ValueData::List(1)).is_err());
    }

    proptest! {
        // Whatever the device reports, a value never changes on a single
        // unconfirmed reading.
        #[test]
        fn prop_change_requires_agreement(readings in proptest::collection::vec(0u8..4, 1..40)) {
            let value = level();
            let mut last: Option<u8> = None;
            let mut changes = 0usize;

            for r in &readings {
                let before = value.data();
                let outcome = value.on_value_refreshed(ValueData::Byte(*r)).unwrap();
                if outcome == RefreshOutcome::Changed {
                    changes += 1;
                    if changes > 1 {
                        prop_assert_eq!(last, Some(*r));
                    }
                } else {
                    prop_assert_eq!(value.data(), before);
                }
                last = Some(*r);
            }
        }
    }
}
