//! Delay modes for safety and change delays

use serde::{Deserialize, Serialize};

use crate::Value;

/// Direction of a requested status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rising,
    Falling,
}

impl Direction {
    /// Direction of a change from `current` to `new`
    ///
    /// Values that cannot be ordered against each other count as rising.
    pub fn of_change(current: &Value, new: &Value) -> Self {
        match new.partial_cmp(current) {
            Some(std::cmp::Ordering::Greater) | None => Direction::Rising,
            _ => Direction::Falling,
        }
    }
}

/// Which change directions a delay applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    #[default]
    Rising,
    Falling,
    Both,
}

impl DelayMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rising" => Some(DelayMode::Rising),
            "falling" => Some(DelayMode::Falling),
            "both" => Some(DelayMode::Both),
            _ => None,
        }
    }

    pub fn applies_to(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (DelayMode::Both, _)
                | (DelayMode::Rising, Direction::Rising)
                | (DelayMode::Falling, Direction::Falling)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction() {
        assert_eq!(
            Direction::of_change(&Value::Int(0), &Value::Int(1)),
            Direction::Rising
        );
        assert_eq!(
            Direction::of_change(&Value::Bool(true), &Value::Bool(false)),
            Direction::Falling
        );
        assert_eq!(
            Direction::of_change(&Value::None, &Value::Str("x".into())),
            Direction::Rising
        );
    }

    #[test]
    fn test_mode_applies() {
        assert!(DelayMode::Both.applies_to(Direction::Falling));
        assert!(DelayMode::Rising.applies_to(Direction::Rising));
        assert!(!DelayMode::Rising.applies_to(Direction::Falling));
        assert!(!DelayMode::Falling.applies_to(Direction::Rising));
    }

    #[test]
    fn test_mode_from_name() {
        assert_eq!(DelayMode::from_name("both"), Some(DelayMode::Both));
        assert_eq!(DelayMode::from_name("falling"), Some(DelayMode::Falling));
        assert_eq!(DelayMode::from_name("sideways"), None);
    }
}
