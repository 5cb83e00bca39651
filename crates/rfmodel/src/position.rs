//! 3-D node positions
//!
//! Positions are plain meters in a right-handed coordinate system with z
//! pointing up. The persisted form is the string `"x,y,z"` used by the
//! topology JSON format.

use crate::RfModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point in the emulated space, in meters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Move `step` meters towards `target`, stopping exactly on it when
    /// closer than one step.
    pub fn step_towards(&self, target: &Position, step: f64) -> Position {
        let dist = self.distance_to(target);
        if dist <= step || dist == 0.0 {
            return *target;
        }
        let f = step / dist;
        Position {
            x: self.x + (target.x - self.x) * f,
            y: self.y + (target.y - self.y) * f,
            z: self.z + (target.z - self.z) * f,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl FromStr for Position {
    type Err = RfModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        // A bare "x,y" is accepted with z = 0, matching saved topologies
        // produced by 2-D editors.
        let (x, y, z) = match parts.as_slice() {
            [x, y] => (x, y, &"0"),
            [x, y, z] => (x, y, z),
            _ => return Err(RfModelError::InvalidPosition(s.to_string())),
        };
        let parse = |v: &str| {
            v.parse::<f64>()
                .map_err(|_| RfModelError::InvalidPosition(s.to_string()))
        };
        Ok(Position::new(parse(x)?, parse(y)?, parse(z)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance_to(&b), 5.0);
    }

    #[test]
    fn parses_two_and_three_components() {
        let p: Position = "10, 20, 5".parse().unwrap();
        assert_eq!(p, Position::new(10.0, 20.0, 5.0));
        let p: Position = "1,2".parse().unwrap();
        assert_eq!(p, Position::new(1.0, 2.0, 0.0));
        assert!("bogus".parse::<Position>().is_err());
    }

    #[test]
    fn step_towards_clamps_at_target() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(1.0, 0.0, 0.0);
        let stepped = a.step_towards(&b, 10.0);
        assert_eq!(stepped, b);
        let halfway = a.step_towards(&b, 0.5);
        assert!((halfway.x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn display_round_trips() {
        let p = Position::new(12.5, 7.0, 0.0);
        let s = p.to_string();
        let back: Position = s.parse().unwrap();
        assert_eq!(p, back);
    }
}
