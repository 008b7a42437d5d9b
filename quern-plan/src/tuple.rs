//! Tuples: ordered value slots sized by a schema. An unset slot is NULL.

use crate::types::Value;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tuple {
    slots: Vec<Option<Value>>,
}

impl Tuple {
    /// A tuple of `len` NULL slots.
    pub fn with_arity(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn from_values(values: Vec<Option<Value>>) -> Self {
        Self { slots: values }
    }

    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.slots.get(i).and_then(|slot| slot.as_ref())
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.slots.get(i).is_none_or(|slot| slot.is_none())
    }

    pub fn set(&mut self, i: usize, value: Option<Value>) {
        self.slots[i] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&Value>> {
        self.slots.iter().map(|slot| slot.as_ref())
    }
}

impl From<Vec<Option<Value>>> for Tuple {
    fn from(values: Vec<Option<Value>>) -> Self {
        Self::from_values(values)
    }
}
