//! Association controller
//!
//! One state machine per station wlan:
//!
//! ```text
//!    DISCONNECTED --scanFound(ap)--> AUTHENTICATING --ok--> ASSOCIATED
//!         ^                                |                    |
//!         |                              fail            rssi < leaveTh
//!         +--------disconnect---leaveRange--+------------------+
//! ```
//!
//! The controller is pure decision logic: it consumes range events and
//! auth results and emits commands; the engine executes them through the
//! node command stream and reports back. Transitions for one station
//! wlan are serialized by the engine's single-writer loop.

use crate::config::AcMethod;
use crate::topology::{IntfId, RangeEvent, Topology};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Auth responses slower than this count as failed.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff schedule; `None` means give up.
pub fn backoff_delay(attempt: u32) -> Option<Duration> {
    match attempt {
        0 => Some(Duration::from_millis(500)),
        1 => Some(Duration::from_secs(1)),
        2 => Some(Duration::from_secs(2)),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssocState {
    Disconnected,
    Authenticating { target: IntfId, attempt: u32 },
    Associated { ap: IntfId },
}

/// What the engine must do on behalf of the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum AssocCommand {
    Associate { sta: IntfId, ap: IntfId, attempt: u32 },
    Disconnect { sta: IntfId },
}

pub struct AssociationController {
    policy: AcMethod,
    states: HashMap<IntfId, AssocState>,
}

impl AssociationController {
    pub fn new(policy: AcMethod) -> Self {
        Self {
            policy,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, sta: IntfId) -> AssocState {
        self.states
            .get(&sta)
            .copied()
            .unwrap_or(AssocState::Disconnected)
    }

    fn set_state(&mut self, sta: IntfId, state: AssocState) {
        debug!("assoc {:?}: -> {:?}", sta, state);
        self.states.insert(sta, state);
    }

    /// Candidate APs for a station: in range, master mode, and carrying
    /// the station's SSID when it has one.
    fn candidates(&self, topo: &Topology, sta: IntfId) -> Vec<IntfId> {
        let Some(sta_intf) = topo.wintf(sta) else {
            return Vec::new();
        };
        sta_intf
            .aps_in_range
            .iter()
            .copied()
            .filter(|ap| match (topo.wintf(*ap).and_then(|a| a.ssid.clone()), &sta_intf.ssid) {
                (Some(ap_ssid), Some(sta_ssid)) => ap_ssid == *sta_ssid,
                (_, None) => true,
                (None, Some(_)) => false,
            })
            .collect()
    }

    /// Pick the best AP per policy. Ties break towards the lower AP
    /// index (arena order).
    pub fn pick(&self, topo: &Topology, sta: IntfId) -> Option<IntfId> {
        let mut candidates = self.candidates(topo, sta);
        if candidates.is_empty() {
            return None;
        }
        // BTreeSet iteration already yields ascending ids; a stable sort
        // by score keeps the lower index on score ties.
        candidates.sort();
        match self.policy {
            AcMethod::Manual => None,
            AcMethod::Ssf => candidates
                .into_iter()
                .map(|ap| (ap, topo.rssi_between(sta, ap).unwrap_or(f64::MIN)))
                .fold(None, |best: Option<(IntfId, f64)>, (ap, rssi)| match best {
                    Some((_, best_rssi)) if best_rssi >= rssi => best,
                    _ => Some((ap, rssi)),
                })
                .map(|(ap, _)| ap),
            AcMethod::Llf => candidates
                .into_iter()
                .map(|ap| {
                    let load = topo
                        .wintf(ap)
                        .map(|a| a.associated_stations.len())
                        .unwrap_or(usize::MAX);
                    (ap, load)
                })
                .fold(None, |best: Option<(IntfId, usize)>, (ap, load)| match best {
                    Some((_, best_load)) if best_load <= load => best,
                    _ => Some((ap, load)),
                })
                .map(|(ap, _)| ap),
        }
    }

    /// Whether `candidate` beats the `current` AP under the policy.
    fn improves(&self, topo: &Topology, sta: IntfId, current: IntfId, candidate: IntfId) -> bool {
        if candidate == current {
            return false;
        }
        match self.policy {
            AcMethod::Manual => false,
            AcMethod::Ssf => {
                let cur = topo.rssi_between(sta, current).unwrap_or(f64::MIN);
                let cand = topo.rssi_between(sta, candidate).unwrap_or(f64::MIN);
                cand > cur
            }
            AcMethod::Llf => {
                let load = |ap: IntfId| {
                    topo.wintf(ap)
                        .map(|a| a.associated_stations.len())
                        .unwrap_or(usize::MAX)
                };
                load(candidate) < load(current)
            }
        }
    }

    /// React to a batch of range events from the mobility tick.
    pub fn handle_events(&mut self, topo: &Topology, events: &[RangeEvent]) -> Vec<AssocCommand> {
        if self.policy == AcMethod::Manual {
            return Vec::new();
        }
        let mut commands = Vec::new();
        for event in events {
            match event {
                RangeEvent::ApEntered { sta, .. } => {
                    if self.state(*sta) == AssocState::Disconnected {
                        if let Some(ap) = self.pick(topo, *sta) {
                            self.set_state(*sta, AssocState::Authenticating { target: ap, attempt: 0 });
                            commands.push(AssocCommand::Associate { sta: *sta, ap, attempt: 0 });
                        }
                    }
                }
                RangeEvent::ApLeft { sta, ap } => match self.state(*sta) {
                    AssocState::Associated { ap: serving } if serving == *ap => {
                        self.set_state(*sta, AssocState::Disconnected);
                        commands.push(AssocCommand::Disconnect { sta: *sta });
                        // Immediately rejoin whatever is still in range.
                        if let Some(next) = self.pick(topo, *sta) {
                            self.set_state(*sta, AssocState::Authenticating { target: next, attempt: 0 });
                            commands.push(AssocCommand::Associate { sta: *sta, ap: next, attempt: 0 });
                        }
                    }
                    AssocState::Authenticating { target, .. } if target == *ap => {
                        self.set_state(*sta, AssocState::Disconnected);
                    }
                    _ => {}
                },
                RangeEvent::RssiBelowBgscan { sta, ap, rssi } => {
                    if let AssocState::Associated { ap: serving } = self.state(*sta) {
                        if serving == *ap {
                            if let Some(candidate) = self.pick(topo, *sta) {
                                if self.improves(topo, *sta, serving, candidate) {
                                    info!(
                                        "assoc {:?}: roaming {:?} -> {:?} (rssi {:.1})",
                                        sta, serving, candidate, rssi
                                    );
                                    self.set_state(
                                        *sta,
                                        AssocState::Authenticating { target: candidate, attempt: 0 },
                                    );
                                    commands.push(AssocCommand::Associate {
                                        sta: *sta,
                                        ap: candidate,
                                        attempt: 0,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        commands
    }

    /// Authentication outcome observed on the node's command stream. A
    /// failure retries with backoff until the schedule is exhausted;
    /// exhaustion is non-fatal and simply returns to DISCONNECTED.
    ///
    /// The failed attempt's own number indexes the backoff schedule, so
    /// the first failure waits 500 ms, the second 1 s, the third 2 s.
    pub fn on_auth_result(
        &mut self,
        sta: IntfId,
        target: IntfId,
        ok: bool,
    ) -> Option<AssocCommand> {
        match self.state(sta) {
            AssocState::Authenticating { target: t, attempt } if t == target => {
                if ok {
                    self.set_state(sta, AssocState::Associated { ap: target });
                    None
                } else if backoff_delay(attempt).is_some() {
                    let next = attempt + 1;
                    self.set_state(sta, AssocState::Authenticating { target, attempt: next });
                    Some(AssocCommand::Associate { sta, ap: target, attempt: next })
                } else {
                    info!("assoc {:?}: giving up on {:?} after {} attempts", sta, target, attempt + 1);
                    self.set_state(sta, AssocState::Disconnected);
                    None
                }
            }
            // Stale result for a superseded attempt; ignore.
            _ => None,
        }
    }

    /// The 5 s authentication timer fired.
    pub fn on_auth_timeout(&mut self, sta: IntfId, target: IntfId) {
        if let AssocState::Authenticating { target: t, .. } = self.state(sta) {
            if t == target {
                self.set_state(sta, AssocState::Disconnected);
            }
        }
    }

    /// Manual disconnect (or topology removal of the serving AP).
    pub fn on_disconnect(&mut self, sta: IntfId) {
        self.set_state(sta, AssocState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::node::test_support::{ap_node, station_node};
    use crate::topology::NodeId;
    use rfmodel::Position;

    fn intf(node: NodeId) -> IntfId {
        IntfId { node, wlan: 0 }
    }

    /// One station at `sta_pos`, APs at the given positions, range sets
    /// already computed.
    fn scenario(sta_pos: (f64, f64, f64), ap_pos: &[(f64, f64, f64)]) -> (Topology, IntfId, Vec<IntfId>) {
        let mut topo = Topology::new(EngineConfig::default());
        let sta = topo.add_node(station_node("sta1", Some(sta_pos))).unwrap();
        let mut aps = Vec::new();
        for (i, pos) in ap_pos.iter().enumerate() {
            let id = topo
                .add_node(ap_node(&format!("ap{}", i + 1), Some(*pos)))
                .unwrap();
            aps.push(intf(id));
        }
        topo.recompute_range_sets();
        (topo, intf(sta), aps)
    }

    #[test]
    fn ssf_picks_the_strongest_ap() {
        let (topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(60.0, 10.0, 0.0), (20.0, 10.0, 0.0)]);
        let ctl = AssociationController::new(AcMethod::Ssf);
        // ap2 is 10 m away, ap1 is 50 m away.
        assert_eq!(ctl.pick(&topo, sta), Some(aps[1]));
    }

    #[test]
    fn ssf_ties_break_to_lower_ap_index() {
        let (topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(10.0, 30.0, 0.0), (10.0, -10.0, 0.0)]);
        let ctl = AssociationController::new(AcMethod::Ssf);
        // Equidistant: the lower arena index wins.
        assert_eq!(ctl.pick(&topo, sta), Some(aps[0]));
    }

    #[test]
    fn llf_picks_the_least_loaded() {
        let (mut topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(20.0, 10.0, 0.0), (15.0, 10.0, 0.0)]);
        // Load up the nearer AP.
        topo.wintf_mut(aps[1])
            .unwrap()
            .associated_stations
            .insert(IntfId { node: NodeId(99), wlan: 0 });
        let ctl = AssociationController::new(AcMethod::Llf);
        assert_eq!(ctl.pick(&topo, sta), Some(aps[0]));
    }

    #[test]
    fn manual_policy_never_acts() {
        let (mut topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(20.0, 10.0, 0.0)]);
        let mut ctl = AssociationController::new(AcMethod::Manual);
        assert_eq!(ctl.pick(&topo, sta), None);
        let events = topo.recompute_range_sets();
        assert!(ctl.handle_events(&topo, &events).is_empty());
        let _ = aps;
    }

    #[test]
    fn entering_range_associates_a_disconnected_station() {
        let (mut topo, sta, aps) = scenario((1000.0, 10.0, 0.0), &[(20.0, 10.0, 0.0)]);
        let mut ctl = AssociationController::new(AcMethod::Ssf);
        // Walk into range.
        topo.node_mut(sta.node).unwrap().core.position = Some(Position::new(25.0, 10.0, 0.0));
        let events = topo.recompute_range_sets();
        let cmds = ctl.handle_events(&topo, &events);
        assert_eq!(
            cmds,
            vec![AssocCommand::Associate { sta, ap: aps[0], attempt: 0 }]
        );
        assert!(matches!(ctl.state(sta), AssocState::Authenticating { .. }));
    }

    #[test]
    fn auth_flow_retries_once_per_backoff_tier_then_gives_up() {
        let (_topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(20.0, 10.0, 0.0)]);
        let mut ctl = AssociationController::new(AcMethod::Ssf);
        ctl.set_state(sta, AssocState::Authenticating { target: aps[0], attempt: 0 });

        // One retry per schedule entry: failures of attempts 0, 1 and 2
        // consume the 0.5 s, 1 s and 2 s tiers.
        let retry1 = ctl.on_auth_result(sta, aps[0], false).unwrap();
        assert_eq!(retry1, AssocCommand::Associate { sta, ap: aps[0], attempt: 1 });
        let retry2 = ctl.on_auth_result(sta, aps[0], false).unwrap();
        assert_eq!(retry2, AssocCommand::Associate { sta, ap: aps[0], attempt: 2 });
        let retry3 = ctl.on_auth_result(sta, aps[0], false).unwrap();
        assert_eq!(retry3, AssocCommand::Associate { sta, ap: aps[0], attempt: 3 });
        // The fourth failure finds the schedule exhausted.
        assert_eq!(ctl.on_auth_result(sta, aps[0], false), None);
        assert_eq!(ctl.state(sta), AssocState::Disconnected);
    }

    #[test]
    fn successful_auth_lands_in_associated() {
        let (_topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(20.0, 10.0, 0.0)]);
        let mut ctl = AssociationController::new(AcMethod::Ssf);
        ctl.set_state(sta, AssocState::Authenticating { target: aps[0], attempt: 0 });
        assert_eq!(ctl.on_auth_result(sta, aps[0], true), None);
        assert_eq!(ctl.state(sta), AssocState::Associated { ap: aps[0] });
    }

    #[test]
    fn timeout_returns_to_disconnected() {
        let (_topo, sta, aps) = scenario((10.0, 10.0, 0.0), &[(20.0, 10.0, 0.0)]);
        let mut ctl = AssociationController::new(AcMethod::Ssf);
        ctl.set_state(sta, AssocState::Authenticating { target: aps[0], attempt: 1 });
        ctl.on_auth_timeout(sta, aps[0]);
        assert_eq!(ctl.state(sta), AssocState::Disconnected);
    }

    #[test]
    fn bgscan_crossing_roams_to_a_better_ap() {
        let (mut topo, sta, aps) =
            scenario((10.0, 30.0, 0.0), &[(10.0, 30.0, 0.0), (60.0, 30.0, 0.0)]);
        let mut ctl = AssociationController::new(AcMethod::Ssf);
        ctl.set_state(sta, AssocState::Associated { ap: aps[0] });
        {
            let w = topo.wintf_mut(sta).unwrap();
            w.associated_to = Some(aps[0]);
            w.bgscan_threshold = Some(-55.0);
        }
        // Drive the station towards ap2 until ap1's signal drops under
        // the bgscan threshold.
        topo.node_mut(sta.node).unwrap().core.position = Some(Position::new(55.0, 30.0, 0.0));
        let events = topo.recompute_range_sets();
        let cmds = ctl.handle_events(&topo, &events);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, AssocCommand::Associate { ap, .. } if *ap == aps[1])));
    }

    #[test]
    fn backoff_schedule_matches_contract() {
        assert_eq!(backoff_delay(0), Some(Duration::from_millis(500)));
        assert_eq!(backoff_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(backoff_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(backoff_delay(3), None);
    }
}
