//! Mobility models
//!
//! Each mobile node holds one model instance. A model is a deterministic
//! function of (current position, elapsed time, tick length, seeded rng),
//! which is what makes runs with the same seed replay identically.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rfmodel::Position;
use serde::{Deserialize, Serialize};

/// Per-node kinematic bounds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MobileParams {
    pub vmin: f64,
    pub vmax: f64,
    /// Lower corner of the movement area.
    pub min: Position,
    /// Upper corner of the movement area.
    pub max: Position,
}

impl Default for MobileParams {
    fn default() -> Self {
        Self {
            vmin: 1.0,
            vmax: 5.0,
            min: Position::new(0.0, 0.0, 0.0),
            max: Position::new(100.0, 100.0, 0.0),
        }
    }
}

impl MobileParams {
    fn random_point(&self, rng: &mut StdRng) -> Position {
        Position {
            x: rng.gen_range(self.min.x..=self.max.x),
            y: rng.gen_range(self.min.y..=self.max.y),
            z: if self.max.z > self.min.z {
                rng.gen_range(self.min.z..=self.max.z)
            } else {
                self.min.z
            },
        }
    }

    fn random_speed(&self, rng: &mut StdRng) -> f64 {
        if self.vmax > self.vmin {
            rng.gen_range(self.vmin..=self.vmax)
        } else {
            self.vmax
        }
    }

    fn clamp(&self, p: Position) -> Position {
        Position {
            x: p.x.clamp(self.min.x, self.max.x),
            y: p.y.clamp(self.min.y, self.max.y),
            z: p.z.clamp(self.min.z, self.max.z),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RandomWaypoint {
    pub pause_s: f64,
    target: Option<Position>,
    speed: f64,
    pause_left: f64,
}

#[derive(Clone, Debug, Default)]
pub struct RandomDirection {
    heading: Option<f64>,
    speed: f64,
}

#[derive(Clone, Debug)]
pub struct GaussMarkov {
    /// Memory coefficient in [0, 1]; 0 is memoryless, 1 is constant.
    pub alpha: f64,
    pub mean_speed: f64,
    /// Fixed heading the walk reverts to, drawn at the first step.
    mean_heading: f64,
    speed: f64,
    heading: f64,
    initialized: bool,
}

impl GaussMarkov {
    pub fn new(alpha: f64, mean_speed: f64) -> Self {
        Self {
            alpha,
            mean_speed,
            mean_heading: 0.0,
            speed: 0.0,
            heading: 0.0,
            initialized: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReferencePointGroup {
    pub group: u32,
    /// Members jitter inside this radius around the group center.
    pub radius: f64,
}

#[derive(Clone, Debug)]
pub struct CoherenceRouteFollow {
    pub route: Vec<Position>,
    pub target_speed: f64,
    /// Acceleration bound in m/s^2 smoothing speed changes.
    pub max_accel: f64,
    next: usize,
    speed: f64,
}

impl CoherenceRouteFollow {
    pub fn new(route: Vec<Position>, target_speed: f64) -> Self {
        Self {
            route,
            target_speed,
            max_accel: 1.0,
            next: 0,
            speed: 0.0,
        }
    }
}

/// Linear motion between two endpoints over a time window, driven from
/// outside (e.g. `startMobility`/`stopMobility` style scripts).
#[derive(Clone, Debug)]
pub struct Tracked {
    pub start: Position,
    pub end: Position,
    pub start_time_s: f64,
    pub end_time_s: f64,
}

/// Replay a recorded (time, position) trace with linear interpolation.
#[derive(Clone, Debug)]
pub struct Replaying {
    pub trace: Vec<(f64, Position)>,
}

#[derive(Clone, Debug)]
pub enum Model {
    RandomWaypoint(RandomWaypoint),
    RandomDirection(RandomDirection),
    GaussMarkov(GaussMarkov),
    ReferencePointGroup(ReferencePointGroup),
    CoherenceRouteFollow(CoherenceRouteFollow),
    Tracked(Tracked),
    Replaying(Replaying),
}

impl Model {
    /// Advance one tick. `group_center` is the current center for
    /// reference-point group members, resolved by the coordinator.
    pub fn step(
        &mut self,
        current: Position,
        elapsed_s: f64,
        dt_s: f64,
        params: &MobileParams,
        group_center: Option<Position>,
        rng: &mut StdRng,
    ) -> Position {
        match self {
            Model::RandomWaypoint(m) => {
                if m.pause_left > 0.0 {
                    m.pause_left = (m.pause_left - dt_s).max(0.0);
                    return current;
                }
                let target = match m.target {
                    Some(t) if current.distance_to(&t) > 1e-9 => t,
                    _ => {
                        let t = params.random_point(rng);
                        m.target = Some(t);
                        m.speed = params.random_speed(rng);
                        t
                    }
                };
                let next = current.step_towards(&target, m.speed * dt_s);
                if next.distance_to(&target) < 1e-9 {
                    m.target = None;
                    m.pause_left = m.pause_s;
                }
                next
            }
            Model::RandomDirection(m) => {
                let heading = match m.heading {
                    Some(h) => h,
                    None => {
                        let h = rng.gen_range(0.0..std::f64::consts::TAU);
                        m.heading = Some(h);
                        m.speed = params.random_speed(rng);
                        h
                    }
                };
                let step = m.speed * dt_s;
                let raw = Position {
                    x: current.x + heading.cos() * step,
                    y: current.y + heading.sin() * step,
                    z: current.z,
                };
                let clamped = params.clamp(raw);
                // Bounce: hitting the boundary picks a fresh direction.
                if clamped.x != raw.x || clamped.y != raw.y {
                    m.heading = None;
                }
                clamped
            }
            Model::GaussMarkov(m) => {
                let Ok(normal) = Normal::new(0.0, 1.0) else {
                    return current;
                };
                if !m.initialized {
                    m.speed = m.mean_speed.clamp(params.vmin, params.vmax);
                    m.mean_heading = rng.gen_range(0.0..std::f64::consts::TAU);
                    m.heading = m.mean_heading;
                    m.initialized = true;
                }
                let a = m.alpha.clamp(0.0, 1.0);
                let root = (1.0 - a * a).sqrt();
                m.speed = a * m.speed + (1.0 - a) * m.mean_speed + root * normal.sample(rng);
                m.speed = m.speed.clamp(params.vmin, params.vmax);
                m.heading =
                    a * m.heading + (1.0 - a) * m.mean_heading + root * normal.sample(rng) * 0.3;
                let step = m.speed * dt_s;
                params.clamp(Position {
                    x: current.x + m.heading.cos() * step,
                    y: current.y + m.heading.sin() * step,
                    z: current.z,
                })
            }
            Model::ReferencePointGroup(m) => {
                let center = group_center.unwrap_or(current);
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                let dist = rng.gen_range(0.0..=m.radius);
                params.clamp(Position {
                    x: center.x + angle.cos() * dist,
                    y: center.y + angle.sin() * dist,
                    z: center.z,
                })
            }
            Model::CoherenceRouteFollow(m) => {
                if m.route.is_empty() {
                    return current;
                }
                let target = m.route[m.next % m.route.len()];
                // Speed coheres towards the target speed under the
                // acceleration bound.
                let dv = (m.target_speed - m.speed).clamp(-m.max_accel * dt_s, m.max_accel * dt_s);
                m.speed += dv;
                let next = current.step_towards(&target, m.speed * dt_s);
                if next.distance_to(&target) < 1e-9 {
                    m.next = (m.next + 1) % m.route.len();
                }
                next
            }
            Model::Tracked(m) => {
                if elapsed_s <= m.start_time_s {
                    m.start
                } else if elapsed_s >= m.end_time_s {
                    m.end
                } else {
                    let f = (elapsed_s - m.start_time_s) / (m.end_time_s - m.start_time_s);
                    Position {
                        x: m.start.x + (m.end.x - m.start.x) * f,
                        y: m.start.y + (m.end.y - m.start.y) * f,
                        z: m.start.z + (m.end.z - m.start.z) * f,
                    }
                }
            }
            Model::Replaying(m) => {
                if m.trace.is_empty() {
                    return current;
                }
                let mut prev = m.trace[0];
                for &(t, p) in &m.trace {
                    if t > elapsed_s {
                        let (t0, p0) = prev;
                        if t <= t0 {
                            return p0;
                        }
                        let f = (elapsed_s - t0) / (t - t0);
                        return Position {
                            x: p0.x + (p.x - p0.x) * f,
                            y: p0.y + (p.y - p0.y) * f,
                            z: p0.z + (p.z - p0.z) * f,
                        };
                    }
                    prev = (t, p);
                }
                m.trace[m.trace.len() - 1].1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn params() -> MobileParams {
        MobileParams::default()
    }

    #[test]
    fn random_waypoint_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut model = Model::RandomWaypoint(RandomWaypoint::default());
        let p = params();
        let mut pos = Position::new(50.0, 50.0, 0.0);
        for i in 0..500 {
            pos = model.step(pos, i as f64 * 0.1, 0.1, &p, None, &mut rng);
            assert!(pos.x >= p.min.x && pos.x <= p.max.x);
            assert!(pos.y >= p.min.y && pos.y <= p.max.y);
        }
    }

    #[test]
    fn random_waypoint_moves_at_bounded_speed() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = Model::RandomWaypoint(RandomWaypoint::default());
        let p = params();
        let mut pos = Position::new(50.0, 50.0, 0.0);
        for i in 0..100 {
            let next = model.step(pos, i as f64 * 0.1, 0.1, &p, None, &mut rng);
            let dist = pos.distance_to(&next);
            assert!(dist <= p.vmax * 0.1 + 1e-9, "step {} too large: {}", i, dist);
            pos = next;
        }
    }

    #[test]
    fn tracked_interpolates_linearly() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Model::Tracked(Tracked {
            start: Position::new(10.0, 30.0, 0.0),
            end: Position::new(60.0, 30.0, 0.0),
            start_time_s: 0.0,
            end_time_s: 25.0,
        });
        let p = params();
        let mid = model.step(Position::default(), 12.5, 0.1, &p, None, &mut rng);
        assert!((mid.x - 35.0).abs() < 1e-9);
        let done = model.step(Position::default(), 30.0, 0.1, &p, None, &mut rng);
        assert_eq!(done, Position::new(60.0, 30.0, 0.0));
    }

    #[test]
    fn replaying_follows_the_trace() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Model::Replaying(Replaying {
            trace: vec![
                (0.0, Position::new(0.0, 0.0, 0.0)),
                (10.0, Position::new(100.0, 0.0, 0.0)),
            ],
        });
        let p = params();
        let at_2s = model.step(Position::default(), 2.0, 0.1, &p, None, &mut rng);
        assert!((at_2s.x - 20.0).abs() < 1e-9);
        let past_end = model.step(Position::default(), 99.0, 0.1, &p, None, &mut rng);
        assert!((past_end.x - 100.0).abs() < 1e-9);
    }

    #[test]
    fn route_follow_visits_waypoints_in_order() {
        let mut rng = StdRng::seed_from_u64(0);
        let route = vec![
            Position::new(10.0, 0.0, 0.0),
            Position::new(10.0, 10.0, 0.0),
        ];
        let mut model = Model::CoherenceRouteFollow(CoherenceRouteFollow::new(route, 5.0));
        let p = params();
        let mut pos = Position::new(0.0, 0.0, 0.0);
        let mut reached_first = false;
        for i in 0..2000 {
            pos = model.step(pos, i as f64 * 0.1, 0.1, &p, None, &mut rng);
            if !reached_first && pos.distance_to(&Position::new(10.0, 0.0, 0.0)) < 1e-6 {
                reached_first = true;
            }
        }
        assert!(reached_first);
        // Ends up orbiting the route, i.e. near some waypoint.
        assert!(pos.y > 0.0);
    }

    #[test]
    fn gauss_markov_alpha_one_walks_a_straight_line() {
        // Full memory: no noise enters and the heading never leaves its
        // mean, so every displacement is identical.
        let mut rng = StdRng::seed_from_u64(5);
        let mut model = Model::GaussMarkov(GaussMarkov::new(1.0, 2.0));
        let p = params();
        let mut pos = Position::new(50.0, 50.0, 0.0);
        let mut deltas = Vec::new();
        for i in 0..20 {
            let next = model.step(pos, i as f64 * 0.1, 0.1, &p, None, &mut rng);
            deltas.push((next.x - pos.x, next.y - pos.y));
            pos = next;
        }
        let (dx0, dy0) = deltas[0];
        for (dx, dy) in deltas {
            assert!((dx - dx0).abs() < 1e-9, "heading drifted: {} vs {}", dx, dx0);
            assert!((dy - dy0).abs() < 1e-9, "heading drifted: {} vs {}", dy, dy0);
        }
    }

    #[test]
    fn gauss_markov_respects_speed_bounds() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut model = Model::GaussMarkov(GaussMarkov::new(0.8, 3.0));
        let p = params();
        let mut pos = Position::new(50.0, 50.0, 0.0);
        for i in 0..200 {
            let next = model.step(pos, i as f64 * 0.1, 0.1, &p, None, &mut rng);
            assert!(pos.distance_to(&next) <= p.vmax * 0.1 + 1e-9);
            pos = next;
        }
    }
}
