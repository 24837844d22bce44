use serde::{Deserialize, Serialize};
use std::fmt;

/// The five flaggable semantic axes, in tensor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Example = 0,
    Color = 1,
    Direction = 2,
    X = 3,
    Y = 4,
}

impl Axis {
    pub const ALL: [Axis; 5] = [Axis::Example, Axis::Color, Axis::Direction, Axis::X, Axis::Y];
}

/// Which semantic axes a tensor materializes.
///
/// Flags are ordered `(example, color, direction, x, y)`. A materialized axis
/// sits at the position given by the number of materialized axes before it;
/// the feature axis always follows them as the innermost axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature([u8; 5]);

impl Signature {
    pub const fn new(flags: [u8; 5]) -> Self {
        Self(flags)
    }

    pub fn flags(&self) -> [u8; 5] {
        self.0
    }

    pub fn has(&self, axis: Axis) -> bool {
        self.0[axis as usize] > 0
    }

    /// Number of materialized semantic axes (feature axis excluded).
    pub fn rank(&self) -> usize {
        self.0.iter().map(|&f| f as usize).sum()
    }

    /// Tensor position of `axis`, if materialized.
    pub fn position(&self, axis: Axis) -> Option<usize> {
        if self.has(axis) {
            Some(self.0[..axis as usize].iter().map(|&f| f as usize).sum())
        } else {
            None
        }
    }

    /// Same signature with the x and y flags exchanged.
    pub fn swap_xy(&self) -> Self {
        let [e, c, d, x, y] = self.0;
        Self([e, c, d, y, x])
    }

    /// True when every flag of `self` is at most the matching flag of `other`.
    pub fn is_below(&self, other: &Signature) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a <= b)
    }

    /// Non-example axes softmax may normalize over, as tensor positions.
    pub fn softmax_axes(&self) -> Vec<usize> {
        let start = self.0[0] as usize;
        (start..self.rank()).collect()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [e, c, d, x, y] = self.0;
        write!(f, "[{}, {}, {}, {}, {}]", e, c, d, x, y)
    }
}

impl From<[u8; 5]> for Signature {
    fn from(flags: [u8; 5]) -> Self {
        Self(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions() {
        let sig = Signature::new([1, 0, 1, 0, 1]);
        assert_eq!(sig.rank(), 3);
        assert_eq!(sig.position(Axis::Example), Some(0));
        assert_eq!(sig.position(Axis::Direction), Some(1));
        assert_eq!(sig.position(Axis::X), None);
        assert_eq!(sig.position(Axis::Y), Some(2));
        assert_eq!(sig.softmax_axes(), vec![1, 2]);
    }

    #[test]
    fn test_ordering_helpers() {
        let low = Signature::new([1, 0, 0, 1, 0]);
        let high = Signature::new([1, 1, 0, 1, 1]);
        assert!(low.is_below(&high));
        assert!(!high.is_below(&low));
        assert_eq!(low.swap_xy(), Signature::new([1, 0, 0, 0, 1]));
        assert_eq!(high.to_string(), "[1, 1, 0, 1, 1]");
    }
}
