//! Polarity inference for events collected without a sentiment score.
//!
//! The default analyzer is rule-based: each token is looked up in a valence
//! lexicon (roughly -4..4), adjusted by nearby boosters and negations, and
//! the sum is squashed into a compound score in [-1, 1].

use std::collections::HashMap;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::Event;

/// Anything that maps free text to a compound polarity in [-1, 1].
pub trait PolarityAnalyzer {
    fn polarity(&self, text: &str) -> f64;
}

const NEGATION_SCALAR: f64 = -0.74;
const BOOST_INCREMENT: f64 = 0.293;
const EXCLAIM_INCREMENT: f64 = 0.292;
const MAX_EXCLAIMS: usize = 4;
const NORMALIZATION_ALPHA: f64 = 15.0;
/// How many preceding tokens a negation or booster reaches.
const LOOKBACK: usize = 3;

pub struct LexiconAnalyzer {
    valence: HashMap<&'static str, f64>,
    boosters: HashMap<&'static str, f64>,
    negations: Vec<&'static str>,
}

impl Default for LexiconAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl LexiconAnalyzer {
    pub fn new() -> Self {
        let valence: HashMap<&'static str, f64> = [
            // positive
            ("approve", 2.0),
            ("approved", 2.0),
            ("approval", 2.0),
            ("launch", 1.3),
            ("launches", 1.3),
            ("bullish", 2.6),
            ("surge", 2.1),
            ("surges", 2.1),
            ("rally", 2.0),
            ("rallies", 2.0),
            ("soar", 2.4),
            ("soars", 2.4),
            ("gain", 1.6),
            ("gains", 1.6),
            ("profit", 1.9),
            ("growth", 1.7),
            ("rise", 1.2),
            ("rises", 1.2),
            ("record", 1.3),
            ("adoption", 1.5),
            ("inflows", 1.4),
            ("interest", 1.0),
            ("support", 1.7),
            ("strong", 2.3),
            ("optimistic", 2.4),
            ("confident", 2.2),
            ("positive", 2.6),
            ("upgrade", 1.6),
            ("breakout", 1.6),
            ("recovery", 1.7),
            ("rebound", 1.5),
            ("win", 2.8),
            ("good", 1.9),
            ("great", 3.1),
            // negative
            ("bearish", -2.6),
            ("crash", -2.9),
            ("crashes", -2.9),
            ("plunge", -2.4),
            ("plunges", -2.4),
            ("drop", -1.4),
            ("drops", -1.4),
            ("fall", -1.4),
            ("falls", -1.4),
            ("decline", -1.6),
            ("loss", -1.8),
            ("losses", -1.8),
            ("outflows", -1.4),
            ("weak", -1.9),
            ("negative", -2.7),
            ("fear", -2.2),
            ("panic", -2.5),
            ("risk", -1.1),
            ("uncertainty", -1.4),
            ("ban", -2.6),
            ("bans", -2.6),
            ("crackdown", -2.1),
            ("lawsuit", -1.9),
            ("hack", -2.5),
            ("hacked", -2.5),
            ("fraud", -3.0),
            ("scam", -3.1),
            ("reject", -2.1),
            ("rejected", -2.1),
            ("delay", -1.3),
            ("delayed", -1.3),
            ("sell-off", -2.0),
            ("selloff", -2.0),
            ("dump", -2.0),
            ("warning", -1.4),
            ("crisis", -3.1),
            ("bad", -2.5),
        ]
        .into_iter()
        .collect();

        let boosters: HashMap<&'static str, f64> = [
            ("very", BOOST_INCREMENT),
            ("extremely", BOOST_INCREMENT),
            ("highly", BOOST_INCREMENT),
            ("massive", BOOST_INCREMENT),
            ("huge", BOOST_INCREMENT),
            ("significantly", BOOST_INCREMENT),
            ("sharply", BOOST_INCREMENT),
            ("slightly", -BOOST_INCREMENT),
            ("somewhat", -BOOST_INCREMENT),
            ("marginally", -BOOST_INCREMENT),
        ]
        .into_iter()
        .collect();

        let negations = vec![
            "not", "no", "never", "none", "nothing", "cannot", "cant", "don't", "dont",
            "doesn't", "doesnt", "didn't", "didnt", "won't", "wont", "isn't", "isnt",
            "aren't", "arent", "wasn't", "wasnt", "without", "hardly",
        ];

        Self {
            valence,
            boosters,
            negations,
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|raw| {
                raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect()
    }

    fn token_valence(&self, tokens: &[String], i: usize) -> Option<f64> {
        let mut v = *self.valence.get(tokens[i].as_str())?;
        let start = i.saturating_sub(LOOKBACK);

        for (distance, prev) in tokens[start..i].iter().rev().enumerate() {
            if let Some(b) = self.boosters.get(prev.as_str()) {
                // Farther boosters count for less.
                let decay = 1.0 - 0.05 * distance as f64;
                v += v.signum() * b * decay;
            }
        }
        if tokens[start..i]
            .iter()
            .any(|t| self.negations.contains(&t.as_str()))
        {
            v *= NEGATION_SCALAR;
        }
        Some(v)
    }
}

impl PolarityAnalyzer for LexiconAnalyzer {
    fn polarity(&self, text: &str) -> f64 {
        let tokens = Self::tokens(text);
        let mut sum: f64 = (0..tokens.len())
            .filter_map(|i| self.token_valence(&tokens, i))
            .sum();

        if sum == 0.0 {
            return 0.0;
        }

        let exclaims = text.matches('!').count().min(MAX_EXCLAIMS) as f64;
        sum += sum.signum() * exclaims * EXCLAIM_INCREMENT;

        (sum / (sum * sum + NORMALIZATION_ALPHA).sqrt()).clamp(-1.0, 1.0)
    }
}

/// Fill in `sentiment_score` where it is missing. Scored events pass
/// through untouched, so running this twice is a no-op.
pub fn infer_sentiment(events: &mut [Event], analyzer: &dyn PolarityAnalyzer) -> usize {
    let mut inferred = 0;
    for event in events.iter_mut().filter(|e| e.sentiment_score.is_none()) {
        let score = analyzer.polarity(&event.description);
        event.sentiment_score = Some(score);
        inferred += 1;
        log(
            Level::Trace,
            Domain::Sentiment,
            "inferred",
            obj(&[
                ("event_type", v_str(&event.event_type)),
                ("source", v_str(&event.source)),
                ("score", v_num(score)),
            ]),
        );
    }
    inferred
}
