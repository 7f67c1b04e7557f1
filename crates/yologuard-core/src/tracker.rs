//! Track/dedup state: correlates recognized regions across frames so one
//! continuous presence produces one access event.
//!
//! Association runs in two stages. Observations are first matched to tracks
//! greedily by box overlap; observations left over that carry a known
//! identity are then matched to an unclaimed track of the same person
//! (fast movement, re-detection after a short gap). Anything still unmatched
//! starts a new track.
//!
//! Lifecycle per track:
//!
//! ```text
//! New --(confirm_frames consecutive hits)--> Confirmed --mark_logged--> Logged
//! Logged --(next update)--> Cooldown
//! any --(silence elapsed, and cooldown elapsed if logged)--> removed
//! any --(matched identity changes)--> New
//! ```

use crate::types::{BoundingBox, Detection, MatchResult, PersonId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    New,
    Confirmed,
    Logged,
    Cooldown,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub bbox: BoundingBox,
    /// `None` for an unknown face.
    pub identity: Option<PersonId>,
    pub person_name: Option<String>,
    pub state: TrackState,
    /// Consecutive frames with the current identity.
    pub hits: u32,
    pub similarity: f32,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_logged_at: Option<Instant>,
}

impl Track {
    fn new(id: u64, obs: &Observation, now: Instant) -> Self {
        Self {
            id,
            bbox: obs.bbox.clone(),
            identity: obs.matched.person_id,
            person_name: obs.matched.person_name.clone(),
            state: TrackState::New,
            hits: 1,
            similarity: obs.matched.similarity,
            first_seen: now,
            last_seen: now,
            last_logged_at: None,
        }
    }

    fn is_expired(&self, now: Instant, settings: &TrackerSettings) -> bool {
        let silent = now.saturating_duration_since(self.last_seen) >= settings.silence;
        let cooled = self
            .last_logged_at
            .map_or(true, |t| now.saturating_duration_since(t) >= settings.cooldown);
        silent && cooled
    }
}

/// One recognized region in the current frame.
#[derive(Debug, Clone)]
pub struct Observation {
    pub bbox: BoundingBox,
    pub matched: MatchResult,
}

impl Observation {
    /// Pair a detection with the match computed from its face crop.
    pub fn new(detection: &Detection, matched: MatchResult) -> Self {
        Self {
            bbox: detection.bbox.clone(),
            matched,
        }
    }
}

/// A track that reached the confirmation count in this update.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub track_id: u64,
    pub person_id: Option<PersonId>,
    pub person_name: Option<String>,
    pub similarity: f32,
    /// Index into the observations passed to `update`.
    pub observation: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    pub confirm_frames: u32,
    pub cooldown: Duration,
    pub silence: Duration,
    pub iou_threshold: f32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            confirm_frames: 2,
            cooldown: Duration::from_secs(3),
            silence: Duration::from_secs(2),
            iou_threshold: 0.3,
        }
    }
}

pub struct TrackTable {
    settings: TrackerSettings,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    /// Track id per observation of the last update.
    assignments: Vec<u64>,
}

impl TrackTable {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            tracks: BTreeMap::new(),
            next_id: 1,
            assignments: Vec::new(),
        }
    }

    /// Applies to the next update; existing tracks keep their state.
    pub fn set_settings(&mut self, settings: TrackerSettings) {
        self.settings = settings;
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.values()
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Track ids assigned to each observation of the last `update`.
    pub fn assignments(&self) -> &[u64] {
        &self.assignments
    }

    /// Feed one processed frame. Returns newly confirmed tracks in
    /// observation order.
    pub fn update(&mut self, observations: &[Observation], now: Instant) -> Vec<Confirmation> {
        self.expire(now);

        for track in self.tracks.values_mut() {
            if track.state == TrackState::Logged {
                track.state = TrackState::Cooldown;
            }
        }

        let mut assigned: Vec<Option<u64>> = vec![None; observations.len()];
        let mut claimed: HashSet<u64> = HashSet::new();

        for (track_id, obs_idx) in self.match_by_overlap(observations) {
            assigned[obs_idx] = Some(track_id);
            claimed.insert(track_id);
        }

        for (obs_idx, obs) in observations.iter().enumerate() {
            if assigned[obs_idx].is_some() {
                continue;
            }
            let Some(person) = obs.matched.person_id else {
                continue;
            };
            let same_person = self
                .tracks
                .values()
                .filter(|t| !claimed.contains(&t.id) && t.identity == Some(person))
                .max_by_key(|t| t.last_seen)
                .map(|t| t.id);
            if let Some(track_id) = same_person {
                assigned[obs_idx] = Some(track_id);
                claimed.insert(track_id);
            }
        }

        let mut confirmations = Vec::new();
        self.assignments.clear();

        for (obs_idx, obs) in observations.iter().enumerate() {
            let track_id = match assigned[obs_idx] {
                Some(id) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        refresh(track, obs, now);
                    }
                    id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.insert(id, Track::new(id, obs, now));
                    claimed.insert(id);
                    tracing::debug!(track = id, identity = ?obs.matched.person_id, "new track");
                    id
                }
            };
            self.assignments.push(track_id);

            if let Some(track) = self.tracks.get_mut(&track_id) {
                if track.state == TrackState::New && track.hits >= self.settings.confirm_frames {
                    track.state = TrackState::Confirmed;
                    confirmations.push(Confirmation {
                        track_id,
                        person_id: track.identity,
                        person_name: track.person_name.clone(),
                        similarity: track.similarity,
                        observation: obs_idx,
                    });
                }
            }
        }

        // A miss breaks the run of consecutive frames.
        for track in self.tracks.values_mut() {
            if !claimed.contains(&track.id) && track.state == TrackState::New {
                track.hits = 0;
            }
        }

        confirmations
    }

    /// Record that the access event for this track was emitted.
    pub fn mark_logged(&mut self, track_id: u64, now: Instant) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.state = TrackState::Logged;
            track.last_logged_at = Some(now);
        }
    }

    /// Drop every track whose silence (and cooldown, once logged) has elapsed.
    pub fn expire(&mut self, now: Instant) {
        let settings = self.settings;
        self.tracks.retain(|id, track| {
            let keep = !track.is_expired(now, &settings);
            if !keep {
                tracing::debug!(track = id, identity = ?track.identity, "track expired");
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.assignments.clear();
    }

    /// Greedy IoU association: all pairs above threshold, best overlap first,
    /// each track and observation used at most once.
    fn match_by_overlap(&self, observations: &[Observation]) -> Vec<(u64, usize)> {
        let mut pairs: Vec<(u64, usize, f32)> = Vec::new();
        for track in self.tracks.values() {
            for (obs_idx, obs) in observations.iter().enumerate() {
                let overlap = track.bbox.iou(&obs.bbox);
                if overlap >= self.settings.iou_threshold && overlap > 0.0 {
                    pairs.push((track.id, obs_idx, overlap));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut used_tracks = HashSet::new();
        let mut used_obs = HashSet::new();
        let mut matches = Vec::new();
        for (track_id, obs_idx, _) in pairs {
            if used_tracks.contains(&track_id) || used_obs.contains(&obs_idx) {
                continue;
            }
            used_tracks.insert(track_id);
            used_obs.insert(obs_idx);
            matches.push((track_id, obs_idx));
        }
        matches
    }
}

fn refresh(track: &mut Track, obs: &Observation, now: Instant) {
    track.bbox = obs.bbox.clone();
    track.last_seen = now;
    track.similarity = obs.matched.similarity;

    if track.identity != obs.matched.person_id {
        tracing::debug!(
            track = track.id,
            from = ?track.identity,
            to = ?obs.matched.person_id,
            "identity changed, track reset"
        );
        track.identity = obs.matched.person_id;
        track.person_name = obs.matched.person_name.clone();
        track.state = TrackState::New;
        track.hits = 1;
        track.last_logged_at = None;
        return;
    }

    track.hits = track.hits.saturating_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 100.0,
            height: 100.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn seen(x: f32, person: Option<u64>) -> Observation {
        Observation {
            bbox: bbox(x),
            matched: MatchResult {
                similarity: 0.9,
                person_id: person.map(PersonId),
                person_name: person.map(|p| format!("p{p}")),
            },
        }
    }

    fn table(confirm: u32) -> TrackTable {
        TrackTable::new(TrackerSettings {
            confirm_frames: confirm,
            cooldown: Duration::from_secs(3),
            silence: Duration::from_secs(2),
            iou_threshold: 0.3,
        })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Runs frames every 100 ms, logging each confirmation. Returns the
    /// frame indices that produced events.
    fn run(t: &mut TrackTable, start: Instant, frames: &[Vec<Observation>]) -> Vec<usize> {
        let mut events = Vec::new();
        for (i, obs) in frames.iter().enumerate() {
            let now = start + ms(100 * i as u64);
            for c in t.update(obs, now) {
                t.mark_logged(c.track_id, now);
                events.push(i);
            }
        }
        events
    }

    #[test]
    fn test_observation_keeps_detection_box() {
        let detection = Detection {
            bbox: bbox(40.0),
            frame_sequence: 9,
            captured_at: Instant::now(),
        };
        let obs = Observation::new(&detection, MatchResult::unknown(0.1));
        assert_eq!(obs.bbox, detection.bbox);
        assert!(!obs.matched.is_match());

        let mut t = table(1);
        t.update(&[obs], Instant::now());
        assert_eq!(t.tracks().next().unwrap().bbox, detection.bbox);
    }

    #[test]
    fn test_confirms_after_exact_count() {
        let mut t = table(3);
        let frames: Vec<_> = (0..6).map(|i| vec![seen(i as f32, Some(1))]).collect();
        assert_eq!(run(&mut t, Instant::now(), &frames), vec![2]);
    }

    #[test]
    fn test_fewer_frames_never_confirm() {
        let mut t = table(3);
        let frames = vec![
            vec![seen(0.0, Some(1))],
            vec![seen(0.0, Some(1))],
            vec![],
            vec![seen(0.0, Some(1))],
            vec![seen(0.0, Some(1))],
        ];
        assert!(run(&mut t, Instant::now(), &frames).is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_one_event_per_presence() {
        let mut t = table(2);
        let frames: Vec<_> = (0..50).map(|_| vec![seen(0.0, Some(1))]).collect();
        assert_eq!(run(&mut t, Instant::now(), &frames), vec![1]);
        let track = t.tracks().next().unwrap();
        assert_eq!(track.state, TrackState::Cooldown);
    }

    #[test]
    fn test_logged_then_cooldown() {
        let mut t = table(1);
        let now = Instant::now();
        let c = t.update(&[seen(0.0, Some(1))], now);
        assert_eq!(c.len(), 1);
        assert_eq!(t.get(c[0].track_id).unwrap().state, TrackState::Confirmed);
        t.mark_logged(c[0].track_id, now);
        assert_eq!(t.get(c[0].track_id).unwrap().state, TrackState::Logged);
        t.update(&[seen(0.0, Some(1))], now + ms(100));
        assert_eq!(t.get(c[0].track_id).unwrap().state, TrackState::Cooldown);
    }

    #[test]
    fn test_short_gap_does_not_relog() {
        let mut t = table(1);
        let start = Instant::now();
        let c = t.update(&[seen(0.0, Some(1))], start);
        t.mark_logged(c[0].track_id, start);

        // gone for 1.5 s (< silence), back in place
        assert!(t.update(&[], start + ms(500)).is_empty());
        assert!(t.update(&[seen(0.0, Some(1))], start + ms(1500)).is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_reappearance_after_silence_and_cooldown_logs_again() {
        let mut t = table(2);
        let start = Instant::now();
        assert_eq!(t.update(&[seen(0.0, Some(1))], start).len(), 0);
        let c = t.update(&[seen(0.0, Some(1))], start + ms(100));
        assert_eq!(c.len(), 1);
        t.mark_logged(c[0].track_id, start + ms(100));

        let back = start + Duration::from_secs(4);
        assert!(t.update(&[seen(0.0, Some(1))], back).is_empty());
        let again = t.update(&[seen(0.0, Some(1))], back + ms(100));
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].track_id, c[0].track_id);
    }

    #[test]
    fn test_silent_but_in_cooldown_is_kept() {
        let mut t = table(1);
        let start = Instant::now();
        let c = t.update(&[seen(0.0, Some(1))], start);
        t.mark_logged(c[0].track_id, start);

        t.expire(start + Duration::from_millis(2500));
        assert_eq!(t.len(), 1);
        t.expire(start + Duration::from_secs(3));
        assert!(t.is_empty());
    }

    #[test]
    fn test_gap_past_silence_inside_cooldown_does_not_relog() {
        let mut t = TrackTable::new(TrackerSettings::default());
        let start = Instant::now();
        assert!(t.update(&[seen(0.0, Some(1))], start).is_empty());
        let c = t.update(&[seen(0.0, Some(1))], start + ms(100));
        assert_eq!(c.len(), 1);
        t.mark_logged(c[0].track_id, start + ms(100));

        // 2.5 s absent: longer than silence (2 s), still within cooldown (3 s)
        let back = start + ms(2600);
        for i in 0..5 {
            assert!(t.update(&[seen(0.0, Some(1))], back + ms(100 * i)).is_empty());
        }
        assert_eq!(t.len(), 1);
        let track = t.get(c[0].track_id).unwrap();
        assert_eq!(track.state, TrackState::Cooldown);
    }

    #[test]
    fn test_identity_change_resets_to_new() {
        let mut t = table(2);
        let start = Instant::now();
        let frames = vec![
            vec![seen(0.0, Some(1))],
            vec![seen(0.0, Some(1))],
            vec![seen(0.0, Some(2))],
            vec![seen(0.0, Some(2))],
        ];
        assert_eq!(run(&mut t, start, &frames), vec![1, 3]);
        let track = t.tracks().next().unwrap();
        assert_eq!(track.identity, Some(PersonId(2)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_identity_fallback_follows_fast_movement() {
        let mut t = table(2);
        let start = Instant::now();
        t.update(&[seen(0.0, Some(1))], start);
        let id = t.assignments()[0];
        // no overlap with the previous box
        let c = t.update(&[seen(400.0, Some(1))], start + ms(100));
        assert_eq!(t.assignments(), &[id]);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_unknown_without_overlap_starts_new_track() {
        let mut t = table(2);
        let start = Instant::now();
        t.update(&[seen(0.0, None)], start);
        t.update(&[seen(400.0, None)], start + ms(100));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_two_people_confirm_in_observation_order() {
        let mut t = table(1);
        let c = t.update(&[seen(500.0, Some(2)), seen(0.0, Some(1))], Instant::now());
        let order: Vec<_> = c.iter().map(|c| c.person_id).collect();
        assert_eq!(order, vec![Some(PersonId(2)), Some(PersonId(1))]);
        assert_eq!(c[1].observation, 1);
    }

    #[test]
    fn test_new_track_expires_after_silence() {
        let mut t = table(3);
        let start = Instant::now();
        t.update(&[seen(0.0, Some(1))], start);
        t.update(&[], start + Duration::from_secs(2));
        assert!(t.is_empty());
    }
}
