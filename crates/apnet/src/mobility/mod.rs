//! Mobility coordinator
//!
//! A single time-driven loop advances every mobile node by its model
//! once per tick (100 ms), then publishes the full position batch to the
//! engine mailbox. The coordinator never touches topology state
//! directly: each tick snapshots, computes, and commits by message, so a
//! cancelled tick can never leave half-updated positions behind.

pub mod models;

pub use models::{MobileParams, Model};

use crate::topology::NodeId;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rfmodel::Position;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Tick length of the coordinator.
pub const TICK: Duration = Duration::from_millis(100);

/// One mobile node's live state inside the coordinator.
struct MobileNode {
    id: NodeId,
    params: MobileParams,
    model: Model,
    position: Position,
}

/// Shared center for a reference-point group, itself a random-waypoint
/// walker.
struct GroupState {
    center: Position,
    model: Model,
    params: MobileParams,
}

/// Position batch published after each tick.
pub type PositionBatch = Vec<(NodeId, Position)>;

/// Observer invoked with each committed batch, e.g. a live plot.
pub type TickCallback = Box<dyn Fn(&PositionBatch) + Send>;

pub struct MobilityCoordinator {
    nodes: Vec<MobileNode>,
    groups: HashMap<u32, GroupState>,
    rng: StdRng,
    elapsed_s: f64,
    on_tick: Option<TickCallback>,
}

impl MobilityCoordinator {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            groups: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            elapsed_s: 0.0,
            on_tick: None,
        }
    }

    /// Install a per-tick observer. Rendering stays outside the engine;
    /// the callback only sees the committed batch.
    pub fn set_tick_callback(&mut self, callback: TickCallback) {
        self.on_tick = Some(callback);
    }

    pub fn add_node(&mut self, id: NodeId, start: Position, params: MobileParams, model: Model) {
        if let Model::ReferencePointGroup(g) = &model {
            self.groups.entry(g.group).or_insert_with(|| GroupState {
                center: start,
                model: Model::RandomWaypoint(models::RandomWaypoint::default()),
                params,
            });
        }
        self.nodes.push(MobileNode {
            id,
            params,
            model,
            position: start,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Advance one tick and return the committed batch. Pure with
    /// respect to everything but the coordinator's own state: two
    /// coordinators with the same seed and inputs produce identical
    /// traces.
    pub fn tick(&mut self, dt_s: f64) -> PositionBatch {
        self.elapsed_s += dt_s;

        // Group centers move first so members see this tick's center.
        let mut centers: HashMap<u32, Position> = HashMap::new();
        for (gid, group) in self.groups.iter_mut() {
            group.center = group.model.step(
                group.center,
                self.elapsed_s,
                dt_s,
                &group.params,
                None,
                &mut self.rng,
            );
            centers.insert(*gid, group.center);
        }

        let mut batch = Vec::with_capacity(self.nodes.len());
        for node in &mut self.nodes {
            let center = match &node.model {
                Model::ReferencePointGroup(g) => centers.get(&g.group).copied(),
                _ => None,
            };
            node.position = node.model.step(
                node.position,
                self.elapsed_s,
                dt_s,
                &node.params,
                center,
                &mut self.rng,
            );
            batch.push((node.id, node.position));
        }
        if let Some(callback) = &self.on_tick {
            callback(&batch);
        }
        batch
    }

    /// Run the tick loop until cancelled. Each committed batch goes out
    /// through `tx`; `pause` suspends ticking without losing state;
    /// `cancel` finishes the in-flight tick and exits.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<PositionBatch>,
        mut pause: watch::Receiver<bool>,
        mut cancel: watch::Receiver<bool>,
    ) {
        info!("Mobility coordinator running ({} mobile nodes)", self.nodes.len());
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = cancel.changed() => {
                    // A dropped sender counts as cancellation.
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *cancel.borrow() {
                break;
            }
            if *pause.borrow() {
                // Parked: wait for resume or cancellation.
                tokio::select! {
                    _ = pause.changed() => {}
                    _ = cancel.changed() => {}
                }
                continue;
            }
            let batch = self.tick(TICK.as_secs_f64());
            if !batch.is_empty() && tx.send(batch).await.is_err() {
                // Engine mailbox is gone; nothing left to publish to.
                break;
            }
        }
        debug!("Mobility coordinator exiting after {:.1}s", self.elapsed_s);
    }
}

#[cfg(test)]
mod tests {
    use super::models::{RandomWaypoint, Tracked};
    use super::*;

    fn coordinator_with_two_walkers(seed: u64) -> MobilityCoordinator {
        let mut coord = MobilityCoordinator::new(seed);
        coord.add_node(
            NodeId(0),
            Position::new(10.0, 10.0, 0.0),
            MobileParams::default(),
            Model::RandomWaypoint(RandomWaypoint::default()),
        );
        coord.add_node(
            NodeId(1),
            Position::new(90.0, 90.0, 0.0),
            MobileParams::default(),
            Model::RandomWaypoint(RandomWaypoint::default()),
        );
        coord
    }

    #[test]
    fn same_seed_gives_identical_traces() {
        let mut a = coordinator_with_two_walkers(42);
        let mut b = coordinator_with_two_walkers(42);
        for _ in 0..300 {
            let batch_a = a.tick(0.1);
            let batch_b = b.tick(0.1);
            for ((id_a, pos_a), (id_b, pos_b)) in batch_a.iter().zip(batch_b.iter()) {
                assert_eq!(id_a, id_b);
                assert!(pos_a.distance_to(pos_b) < 1e-6);
            }
        }
    }

    #[test]
    fn tick_callback_sees_each_batch() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut coord = coordinator_with_two_walkers(3);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        coord.set_tick_callback(Box::new(move |batch| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
        }));
        for _ in 0..10 {
            coord.tick(0.1);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = coordinator_with_two_walkers(1);
        let mut b = coordinator_with_two_walkers(2);
        let mut diverged = false;
        for _ in 0..100 {
            let batch_a = a.tick(0.1);
            let batch_b = b.tick(0.1);
            if batch_a
                .iter()
                .zip(batch_b.iter())
                .any(|((_, pa), (_, pb))| pa.distance_to(pb) > 1e-3)
            {
                diverged = true;
                break;
            }
        }
        assert!(diverged);
    }

    #[test]
    fn group_members_follow_their_center() {
        let mut coord = MobilityCoordinator::new(7);
        let params = MobileParams::default();
        for i in 0..3 {
            coord.add_node(
                NodeId(i),
                Position::new(50.0, 50.0, 0.0),
                params,
                Model::ReferencePointGroup(models::ReferencePointGroup {
                    group: 1,
                    radius: 5.0,
                }),
            );
        }
        for _ in 0..100 {
            let batch = coord.tick(0.1);
            let center = coord.groups[&1].center;
            for (_, pos) in batch {
                assert!(pos.distance_to(&center) <= 5.0 + 1e-9);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_batches_and_honors_cancel() {
        let mut coord = MobilityCoordinator::new(5);
        coord.add_node(
            NodeId(0),
            Position::new(0.0, 0.0, 0.0),
            MobileParams::default(),
            Model::Tracked(Tracked {
                start: Position::new(0.0, 0.0, 0.0),
                end: Position::new(10.0, 0.0, 0.0),
                start_time_s: 0.0,
                end_time_s: 10.0,
            }),
        );

        let (tx, mut rx) = mpsc::channel(16);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(coord.run(tx, pause_rx, cancel_rx));

        // A few ticks worth of virtual time.
        tokio::time::advance(Duration::from_millis(350)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, NodeId(0));

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_suspends_ticking() {
        let mut coord = MobilityCoordinator::new(5);
        coord.add_node(
            NodeId(0),
            Position::new(0.0, 0.0, 0.0),
            MobileParams::default(),
            Model::RandomWaypoint(RandomWaypoint::default()),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let (pause_tx, pause_rx) = watch::channel(true);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(coord.run(tx, pause_rx, cancel_rx));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err(), "paused coordinator must not publish");

        pause_tx.send(false).unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(rx.recv().await.is_some());

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
