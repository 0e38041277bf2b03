//! Multi-indices of the tensorised Legendre chaos.
use serde::{Deserialize, Serialize};
use std::fmt;

/// A finitely supported sequence of polynomial orders, one per coefficient mode.
///
/// Trailing zeros are never stored, so structurally equal indices compare equal regardless of how
/// they were built. The zero index is the deterministic (mean) mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "Vec<u32>", into = "Vec<u32>")]
pub struct MultiIndex {
    orders: Vec<u32>,
}

impl MultiIndex {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_orders(orders: impl Into<Vec<u32>>) -> Self {
        let mut orders = orders.into();
        while orders.last() == Some(&0) {
            orders.pop();
        }
        Self { orders }
    }

    /// The unit index `e_m`.
    pub fn unit(m: usize) -> Self {
        Self::zero().increment(m)
    }

    pub fn is_zero(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn order(&self, m: usize) -> u32 {
        self.orders.get(m).copied().unwrap_or(0)
    }

    pub fn orders(&self) -> &[u32] {
        &self.orders
    }

    /// Total polynomial degree `|μ| = Σ μ_m`.
    pub fn total_order(&self) -> u32 {
        self.orders.iter().sum()
    }

    /// One past the largest mode with non-zero order.
    pub fn support_len(&self) -> usize {
        self.orders.len()
    }

    /// Non-zero `(mode, order)` pairs.
    pub fn active_modes(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.orders
            .iter()
            .enumerate()
            .filter(|(_, &order)| order > 0)
            .map(|(m, &order)| (m, order))
    }

    /// `μ + e_m`
    pub fn increment(&self, m: usize) -> Self {
        let mut orders = self.orders.clone();
        if orders.len() <= m {
            orders.resize(m + 1, 0);
        }
        orders[m] += 1;
        Self { orders }
    }

    /// `μ - e_m`, if `μ_m > 0`.
    pub fn decrement(&self, m: usize) -> Option<Self> {
        if self.order(m) == 0 {
            return None;
        }
        let mut orders = self.orders.clone();
        orders[m] -= 1;
        Some(Self::from_orders(orders))
    }

    /// All immediate predecessors `μ - e_k`.
    pub fn predecessors(&self) -> impl Iterator<Item = MultiIndex> + '_ {
        (0..self.orders.len()).filter_map(move |k| self.decrement(k))
    }

    /// Componentwise `self <= other`.
    pub fn is_componentwise_le(&self, other: &MultiIndex) -> bool {
        self.orders.len() <= other.orders.len()
            && self
                .orders
                .iter()
                .zip(&other.orders)
                .all(|(a, b)| a <= b)
    }
}

impl From<Vec<u32>> for MultiIndex {
    fn from(orders: Vec<u32>) -> Self {
        Self::from_orders(orders)
    }
}

impl From<MultiIndex> for Vec<u32> {
    fn from(index: MultiIndex) -> Self {
        index.orders
    }
}

impl fmt::Display for MultiIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, order) in self.orders.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", order)?;
        }
        write!(f, "]")
    }
}
