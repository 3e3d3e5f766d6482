// direction.rs — Step counter → sweep direction.
//
// The caller owns an ever-increasing step counter. Each call to the engine
// runs one sweep whose direction is `step mod 4`:
//
//   0 → LeftToRight   1 → TopToBottom   2 → RightToLeft   3 → BottomToTop
//
// The modulo is floor-style (`rem_euclid`), so step -1 lands on BottomToTop
// exactly like step 3. Rust's `%` would give -1 there.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four scan directions of a relaxation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    LeftToRight,
    TopToBottom,
    RightToLeft,
    BottomToTop,
}

/// Order in which channel planes are visited.
///
/// Channels never interact, so this does not change the result. It is fixed
/// anyway so that traces and partial-progress observations match across
/// implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Ascending,
    Descending,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::LeftToRight,
        Direction::TopToBottom,
        Direction::RightToLeft,
        Direction::BottomToTop,
    ];

    /// Direction for a caller step index, floor modulo 4.
    pub fn from_step(step: i64) -> Self {
        match step.rem_euclid(4) {
            0 => Direction::LeftToRight,
            1 => Direction::TopToBottom,
            2 => Direction::RightToLeft,
            _ => Direction::BottomToTop,
        }
    }

    /// Inverse of `from_step` on 0..4.
    pub fn index(self) -> u32 {
        match self {
            Direction::LeftToRight => 0,
            Direction::TopToBottom => 1,
            Direction::RightToLeft => 2,
            Direction::BottomToTop => 3,
        }
    }

    /// Forward sweeps add the gradient sample, backward sweeps subtract it.
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::LeftToRight | Direction::TopToBottom)
    }

    /// Horizontal sweeps chain along columns; vertical sweeps chain rows.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::LeftToRight | Direction::RightToLeft)
    }

    pub fn channel_order(self) -> ChannelOrder {
        match self {
            Direction::BottomToTop => ChannelOrder::Descending,
            _ => ChannelOrder::Ascending,
        }
    }

    /// Channel indices in visiting order.
    pub(crate) fn channels(self, count: usize) -> Box<dyn Iterator<Item = usize>> {
        match self.channel_order() {
            ChannelOrder::Ascending => Box::new(0..count),
            ChannelOrder::Descending => Box::new((0..count).rev()),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::LeftToRight => "left-to-right",
            Direction::TopToBottom => "top-to-bottom",
            Direction::RightToLeft => "right-to-left",
            Direction::BottomToTop => "bottom-to-top",
        };
        f.write_str(name)
    }
}
