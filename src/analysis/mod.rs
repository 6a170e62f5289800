//! Per-method address analysis
//!
//! [`classify`] records every address an instruction stream targets or
//! references, and [`assign_labels`] gives the ones inside the method a
//! synthetic name. Both work on an [`AddressTable`] that is built fresh for
//! each method and thrown away once the listing is rendered.

mod classify;
mod labels;

pub use self::classify::classify;
pub use self::labels::{assign_labels, FUNCTION_PREFIX, LABEL_PREFIX};

use std::collections::BTreeMap;

use crate::Address;

/// How strongly an address is known to be a target.
///
/// The order is a lattice: a later write may raise an address's kind but
/// never lower it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressKind {
    /// Probably code that starts a new block, but nothing jumps here.
    /// Only influences classification; it gets no markup in the listing.
    Unknown,
    /// Referenced as data
    Data,
    /// Start of an IL statement's native code
    BlockStart,
    /// Target of a branch or an IP-relative reference into the method
    Branch,
    /// Target of a direct call
    Call,
}

/// What is known about one address of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub kind: AddressKind,
    /// Synthetic name, attached once by the label pass
    pub name: Option<String>,
    /// IL offset whose native code starts here
    pub il_offset: Option<i32>,
}

impl AddressInfo {
    fn new(kind: AddressKind) -> Self {
        Self {
            kind,
            name: None,
            il_offset: None,
        }
    }

    /// Raise the kind to `kind` if it is stronger.
    pub fn raise(&mut self, kind: AddressKind) {
        if kind > self.kind {
            self.kind = kind;
        }
    }
}

/// Every address of interest in one method, ordered by address.
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    entries: BTreeMap<Address, AddressInfo>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address` with at least `kind` and return its entry.
    pub fn record(&mut self, address: Address, kind: AddressKind) -> &mut AddressInfo {
        let info = self
            .entries
            .entry(address)
            .or_insert_with(|| AddressInfo::new(kind));
        info.raise(kind);
        info
    }

    pub fn get(&self, address: Address) -> Option<&AddressInfo> {
        self.entries.get(&address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.entries.contains_key(&address)
    }

    /// Synthetic name assigned to `address`, if any.
    pub fn name(&self, address: Address) -> Option<&str> {
        self.entries.get(&address).and_then(|info| info.name.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (Address, &AddressInfo)> {
        self.entries.iter().map(|(addr, info)| (*addr, info))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (Address, &mut AddressInfo)> {
        self.entries.iter_mut().map(|(addr, info)| (*addr, info))
    }
}
