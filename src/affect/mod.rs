//! # Affect Model
//!
//! Maps AI utterances onto Russell's circumplex (valence × arousal) and keeps
//! the character's mood moving smoothly from turn to turn.
//!
//! ## Pipeline:
//! 1. **Heuristic label**: keyword lexicon scoring, relationship bias fallback
//! 2. **Label → point**: canonical (valence, arousal) coordinates per label
//! 3. **Personality modulation**: four-letter personality code scales the point
//! 4. **Re-label**: nearest canonical label, intensity from arousal
//! 5. **Inertia**: blend with the previous state, weights driven by familiarity
//!
//! Everything here is pure and deterministic, so concurrent calls from several
//! sessions need no coordination.

pub mod lexicon;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discrete emotion labels understood by the client (avatar packs are keyed by these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionLabel {
    Happy,
    Sad,
    Angry,
    Neutral,
    Thinking,
    Excited,
    Surprised,
    Loving,
    Anxious,
    Jealous,
    Shy,
    Disappointed,
    Frustrated,
    Proud,
    Grateful,
    Bored,
    Curious,
    Embarrassed,
    Playful,
    Lonely,
    Confused,
}

/// Canonical circumplex coordinates, in nearest-neighbour search order.
///
/// Ties during re-labelling resolve to the entry listed first.
pub const CIRCUMPLEX: [(EmotionLabel, f64, f64); 21] = [
    (EmotionLabel::Excited, 0.8, 0.9),
    (EmotionLabel::Happy, 0.7, 0.5),
    (EmotionLabel::Loving, 0.8, 0.4),
    (EmotionLabel::Neutral, 0.0, 0.2),
    (EmotionLabel::Thinking, 0.1, 0.4),
    (EmotionLabel::Surprised, 0.3, 0.85),
    (EmotionLabel::Jealous, -0.5, 0.75),
    (EmotionLabel::Shy, 0.3, 0.35),
    (EmotionLabel::Anxious, -0.4, 0.8),
    (EmotionLabel::Sad, -0.7, 0.2),
    (EmotionLabel::Angry, -0.8, 0.9),
    (EmotionLabel::Disappointed, -0.6, 0.35),
    (EmotionLabel::Frustrated, -0.5, 0.65),
    (EmotionLabel::Proud, 0.7, 0.65),
    (EmotionLabel::Grateful, 0.65, 0.25),
    (EmotionLabel::Bored, -0.3, 0.1),
    (EmotionLabel::Curious, 0.3, 0.55),
    (EmotionLabel::Embarrassed, -0.3, 0.55),
    (EmotionLabel::Playful, 0.55, 0.75),
    (EmotionLabel::Lonely, -0.55, 0.15),
    (EmotionLabel::Confused, -0.15, 0.45),
];

impl EmotionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Angry => "angry",
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Thinking => "thinking",
            EmotionLabel::Excited => "excited",
            EmotionLabel::Surprised => "surprised",
            EmotionLabel::Loving => "loving",
            EmotionLabel::Anxious => "anxious",
            EmotionLabel::Jealous => "jealous",
            EmotionLabel::Shy => "shy",
            EmotionLabel::Disappointed => "disappointed",
            EmotionLabel::Frustrated => "frustrated",
            EmotionLabel::Proud => "proud",
            EmotionLabel::Grateful => "grateful",
            EmotionLabel::Bored => "bored",
            EmotionLabel::Curious => "curious",
            EmotionLabel::Embarrassed => "embarrassed",
            EmotionLabel::Playful => "playful",
            EmotionLabel::Lonely => "lonely",
            EmotionLabel::Confused => "confused",
        }
    }

    /// Canonical (valence, arousal) for this label.
    pub fn canonical_point(&self) -> (f64, f64) {
        CIRCUMPLEX
            .iter()
            .find(|(label, _, _)| label == self)
            .map(|&(_, valence, arousal)| (valence, arousal))
            .unwrap_or((0.0, 0.2))
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmotionLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        CIRCUMPLEX
            .iter()
            .map(|(label, _, _)| *label)
            .find(|label| label.as_str() == wanted)
            .ok_or_else(|| format!("Unknown emotion label: {}", s))
    }
}

/// Coarse strength of an emotion, derived from arousal alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Mid,
    High,
}

impl Intensity {
    /// `low` below 0.35, `mid` up to and including 0.65, `high` above.
    pub fn from_arousal(arousal: f64) -> Self {
        if arousal < 0.35 {
            Intensity::Low
        } else if arousal <= 0.65 {
            Intensity::Mid
        } else {
            Intensity::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Mid => "mid",
            Intensity::High => "high",
        }
    }
}

impl FromStr for Intensity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Intensity::Low),
            // older rows were written with "medium"
            "mid" | "medium" => Ok(Intensity::Mid),
            "high" => Ok(Intensity::High),
            _ => Err(format!("Unknown intensity: {}", s)),
        }
    }
}

/// A point in the circumplex plus its discretisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionState {
    /// -1.0 (unpleasant) to +1.0 (pleasant)
    pub valence: f64,
    /// 0.0 (calm) to 1.0 (intense)
    pub arousal: f64,
    pub label: EmotionLabel,
    pub intensity: Intensity,
}

impl EmotionState {
    /// Build a state from raw coordinates, clamping and discretising them.
    pub fn from_point(valence: f64, arousal: f64) -> Self {
        let valence = valence.clamp(-1.0, 1.0);
        let arousal = arousal.clamp(0.0, 1.0);
        Self {
            valence,
            arousal,
            label: nearest_label(valence, arousal),
            intensity: Intensity::from_arousal(arousal),
        }
    }

    pub fn neutral() -> Self {
        Self::from_point(0.0, 0.2)
    }
}

impl Default for EmotionState {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Nearest canonical label by Euclidean distance.
pub fn nearest_label(valence: f64, arousal: f64) -> EmotionLabel {
    let mut best = EmotionLabel::Neutral;
    let mut best_distance = f64::INFINITY;
    for &(label, v, a) in CIRCUMPLEX.iter() {
        let distance = (valence - v).hypot(arousal - a);
        if distance < best_distance {
            best_distance = distance;
            best = label;
        }
    }
    best
}

/// Scaling factors decoded from a four-letter personality code (e.g. "ENFP").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Personality {
    pub arousal_scale: f64,
    pub valence_scale: f64,
}

impl Personality {
    /// Returns `None` for missing or malformed codes (fewer than four letters).
    pub fn from_code(code: &str) -> Option<Self> {
        let letters: Vec<char> = code.trim().chars().map(|c| c.to_ascii_uppercase()).collect();
        if letters.len() < 4 {
            return None;
        }

        let arousal_scale = match letters[0] {
            'E' => 1.15,
            'I' => 0.85,
            _ => 1.0,
        };
        let valence_scale = match letters[2] {
            'F' => 1.20,
            'T' => 0.80,
            _ => 1.0,
        };

        Some(Self { arousal_scale, valence_scale })
    }

    pub fn modulate(&self, valence: f64, arousal: f64) -> (f64, f64) {
        (
            (valence * self.valence_scale).clamp(-1.0, 1.0),
            (arousal * self.arousal_scale).clamp(0.0, 1.0),
        )
    }
}

/// Relationship context a character brings to classification.
#[derive(Debug, Clone, Copy)]
pub struct AffectContext<'a> {
    pub relationship_type: Option<&'a str>,
    /// 1-10, how close the character is to the user
    pub familiarity: u8,
    pub personality_code: Option<&'a str>,
}

impl Default for AffectContext<'_> {
    fn default() -> Self {
        Self {
            relationship_type: None,
            familiarity: 5,
            personality_code: None,
        }
    }
}

/// Blend weights `(previous, new)` for the inertia step.
pub fn inertia_weights(previous: &EmotionState, familiarity: u8) -> (f64, f64) {
    // leaving neutral is always quick
    if previous.label == EmotionLabel::Neutral {
        return (0.3, 0.7);
    }

    match familiarity {
        8.. => (0.35, 0.65),
        5..=7 => (0.50, 0.50),
        _ => (0.65, 0.35),
    }
}

/// Blend `new` toward `previous`, then re-discretise.
pub fn apply_inertia(previous: &EmotionState, new: &EmotionState, familiarity: u8) -> EmotionState {
    let (w_prev, w_new) = inertia_weights(previous, familiarity);
    EmotionState::from_point(
        previous.valence * w_prev + new.valence * w_new,
        previous.arousal * w_prev + new.arousal * w_new,
    )
}

/// Map a heuristic label into the circumplex, applying personality modulation.
pub fn label_to_state(label: EmotionLabel, personality_code: Option<&str>) -> EmotionState {
    let (valence, arousal) = label.canonical_point();
    let (valence, arousal) = match personality_code.and_then(Personality::from_code) {
        Some(personality) => personality.modulate(valence, arousal),
        None => (valence, arousal),
    };
    EmotionState::from_point(valence, arousal)
}

/// Classify an utterance into an [`EmotionState`].
///
/// `previous`, when present, pulls the result toward the character's current mood.
pub fn classify(text: &str, context: &AffectContext<'_>, previous: Option<&EmotionState>) -> EmotionState {
    let label = lexicon::heuristic_label(text, context.relationship_type, context.familiarity);
    let fresh = label_to_state(label, context.personality_code);

    match previous {
        Some(previous) => apply_inertia(previous, &fresh, context.familiarity),
        None => fresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_intensity_thresholds() {
        assert_eq!(Intensity::from_arousal(0.2), Intensity::Low);
        assert_eq!(Intensity::from_arousal(0.35), Intensity::Mid);
        assert_eq!(Intensity::from_arousal(0.5), Intensity::Mid);
        assert_eq!(Intensity::from_arousal(0.65), Intensity::Mid);
        assert_eq!(Intensity::from_arousal(0.650001), Intensity::High);
        assert_eq!(Intensity::from_arousal(0.8), Intensity::High);
    }

    #[test]
    fn test_canonical_points_label_themselves() {
        for &(label, valence, arousal) in CIRCUMPLEX.iter() {
            assert_eq!(nearest_label(valence, arousal), label);
        }
    }

    #[test]
    fn test_happy_scenario_without_context() {
        let state = classify("haha that's awesome!", &AffectContext::default(), None);
        assert_eq!(state.label, EmotionLabel::Happy);
        assert_eq!(state.intensity, Intensity::Mid);
        assert!(close(state.valence, 0.7));
        assert!(close(state.arousal, 0.5));
    }

    #[test]
    fn test_no_match_without_relationship_is_neutral() {
        for text in ["", "ok.", "The train leaves at nine tomorrow morning from platform 4"] {
            let state = classify(text, &AffectContext::default(), None);
            assert_eq!(state.label, EmotionLabel::Neutral, "text: {:?}", text);
        }
    }

    #[test]
    fn test_nemesis_bias_at_high_familiarity() {
        let context = AffectContext {
            relationship_type: Some("Nemesis"),
            familiarity: 8,
            personality_code: None,
        };
        let state = classify("ok.", &context, None);
        assert_eq!(state.label, EmotionLabel::Angry);
    }

    #[test]
    fn test_personality_modulation() {
        // introvert thinker dampens both axes
        let state = label_to_state(EmotionLabel::Excited, Some("INTJ"));
        assert!(close(state.valence, 0.8 * 0.8));
        assert!(close(state.arousal, 0.9 * 0.85));

        // extravert feeler amplifies and clamps
        let state = label_to_state(EmotionLabel::Angry, Some("enfp"));
        assert!(close(state.valence, -0.96));
        assert!(close(state.arousal, 1.0));
        assert_eq!(state.label, EmotionLabel::Angry);

        // malformed codes are ignored
        assert_eq!(label_to_state(EmotionLabel::Happy, Some("EN")), label_to_state(EmotionLabel::Happy, None));
    }

    #[test]
    fn test_inertia_idempotent_when_equal() {
        for &(label, _, _) in CIRCUMPLEX.iter() {
            let state = label_to_state(label, None);
            for familiarity in [1, 5, 9] {
                let blended = apply_inertia(&state, &state, familiarity);
                assert!(close(blended.valence, state.valence));
                assert!(close(blended.arousal, state.arousal));
                assert_eq!(blended.label, state.label);
                assert_eq!(blended.intensity, state.intensity);
            }
        }
    }

    #[test]
    fn test_escape_from_neutral_ignores_familiarity() {
        let neutral = EmotionState::neutral();
        for familiarity in 0..=10 {
            assert_eq!(inertia_weights(&neutral, familiarity), (0.3, 0.7));
        }

        let happy = label_to_state(EmotionLabel::Happy, None);
        assert_eq!(inertia_weights(&happy, 9), (0.35, 0.65));
        assert_eq!(inertia_weights(&happy, 6), (0.50, 0.50));
        assert_eq!(inertia_weights(&happy, 2), (0.65, 0.35));
    }

    #[test]
    fn test_inertia_blend_values() {
        let previous = EmotionState::neutral();
        let state = classify("haha awesome", &AffectContext::default(), Some(&previous));
        assert!(close(state.valence, 0.7 * 0.7));
        assert!(close(state.arousal, 0.2 * 0.3 + 0.5 * 0.7));
        assert_eq!(state.label, nearest_label(state.valence, state.arousal));
        assert_eq!(state.intensity, Intensity::Mid);
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!("Loving".parse::<EmotionLabel>(), Ok(EmotionLabel::Loving));
        assert!("grumpy".parse::<EmotionLabel>().is_err());
        assert_eq!("medium".parse::<Intensity>(), Ok(Intensity::Mid));
        assert_eq!(serde_json::to_string(&EmotionLabel::Embarrassed).unwrap(), "\"embarrassed\"");
    }
}
