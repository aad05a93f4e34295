//! Query scoring: offset-histogram voting per candidate song, ranking,
//! ambiguity rejection and the final accept/reject decision.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::fingerprint::{Fingerprint, Mode};
use crate::persistance::{FingerprintIndex, SongId, StoreError};

/// Thresholds for one capture mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchProfile {
    pub mode: Mode,
    /// Width in seconds of one offset-histogram bucket.
    pub time_window: f64,
    pub min_aligned: usize,
    /// Below this density a file-mode candidate scores zero.
    pub min_density: f64,
    pub ambiguity_margin: f64,
    pub min_confidence: f64,
    pub min_acceptance_density: f64,
    pub max_confidence: f64,
}

impl MatchProfile {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Live => Self {
                mode,
                time_window: 0.15,
                min_aligned: 8,
                min_density: 0.05,
                ambiguity_margin: 10.0,
                min_confidence: 20.0,
                min_acceptance_density: 0.05,
                max_confidence: 90.0,
            },
            Mode::File => Self {
                mode,
                time_window: 0.10,
                min_aligned: 10,
                min_density: 0.2,
                ambiguity_margin: 10.0,
                min_confidence: 25.0,
                min_acceptance_density: 0.1,
                max_confidence: 100.0,
            },
        }
    }

    fn score(&self, aligned: usize, matches: usize, density: f64, total: usize) -> f64 {
        match self.mode {
            Mode::Live => {
                let coverage = if total == 0 { 0.0 } else { matches as f64 / total as f64 };
                2.0 * aligned as f64 + coverage
            }
            Mode::File if aligned >= self.min_aligned && density >= self.min_density => aligned as f64,
            Mode::File => 0.0,
        }
    }

    fn confidence(&self, score: f64, density: f64, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let raw = match self.mode {
            Mode::Live => (score / 5.0) * 100.0 * (density / 0.1),
            Mode::File => score / total.min(20) as f64 * 100.0,
        };
        raw.min(self.max_confidence)
    }
}

/// One song's vote tally.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub song_id: SongId,
    pub score: f64,
    pub density: f64,
    /// Size of the largest offset bucket.
    pub aligned: usize,
    /// Every index hit for this song.
    pub matches: usize,
    /// Position in the song, in seconds, where the query lines up.
    pub offset: f64,
}

impl Candidate {
    /// Bucket the `query - stored` deltas and keep the fullest bucket.
    ///
    /// A delta halfway between two buckets goes to the upper one, for
    /// negative deltas too.
    pub fn tally(song_id: SongId, deltas: &[f64], total: usize, profile: &MatchProfile) -> Self {
        let mut buckets: BTreeMap<i64, usize> = BTreeMap::new();
        for delta in deltas {
            let bucket = (delta / profile.time_window + 0.5).floor() as i64;
            *buckets.entry(bucket).or_default() += 1;
        }

        let (bucket, aligned) = buckets
            .into_iter()
            .fold((0, 0), |best, (bucket, count)| if count > best.1 { (bucket, count) } else { best });

        let density = if total == 0 { 0.0 } else { aligned as f64 / total as f64 };
        let score = profile.score(aligned, deltas.len(), density, total);

        Self {
            song_id,
            score,
            density,
            aligned,
            matches: deltas.len(),
            offset: -(bucket as f64 * profile.time_window),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStats {
    pub total_fingerprints: usize,
    pub candidates: usize,
    pub best_score: f64,
    pub best_density: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    NoCandidates,
    Ambiguous,
    BelowThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        candidate: Candidate,
        confidence: f64,
        stats: MatchStats,
    },
    NoMatch {
        reason: Rejection,
        confidence: f64,
        stats: MatchStats,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn stats(&self) -> &MatchStats {
        match self {
            MatchResult::Matched { stats, .. } | MatchResult::NoMatch { stats, .. } => stats,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            MatchResult::Matched { confidence, .. } | MatchResult::NoMatch { confidence, .. } => {
                *confidence
            }
        }
    }

    pub fn matched_song(&self) -> Option<SongId> {
        match self {
            MatchResult::Matched { candidate, .. } => Some(candidate.song_id),
            MatchResult::NoMatch { .. } => None,
        }
    }
}

/// Rank tallies and decide. `total` is the number of query fingerprints.
pub fn decide(mut candidates: Vec<Candidate>, total: usize, profile: &MatchProfile) -> MatchResult {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.song_id.cmp(&b.song_id)));

    let mut stats = MatchStats {
        total_fingerprints: total,
        candidates: candidates.len(),
        best_score: 0.0,
        best_density: 0.0,
    };

    if let [first, second, ..] = candidates.as_slice() {
        if first.score - second.score < profile.ambiguity_margin {
            debug!(first = %first.song_id, second = %second.song_id, "ambiguous match rejected");
            stats.best_score = first.score;
            stats.best_density = first.density;
            return MatchResult::NoMatch {
                reason: Rejection::Ambiguous,
                confidence: 0.0,
                stats,
            };
        }
    }

    let Some(best) = candidates.into_iter().next().filter(|c| c.score > 0.0) else {
        return MatchResult::NoMatch {
            reason: if stats.candidates == 0 {
                Rejection::NoCandidates
            } else {
                Rejection::BelowThreshold
            },
            confidence: 0.0,
            stats,
        };
    };

    stats.best_score = best.score;
    stats.best_density = best.density;
    let confidence = profile.confidence(best.score, best.density, total);

    if confidence >= profile.min_confidence
        && best.density >= profile.min_acceptance_density
        && best.aligned >= profile.min_aligned
    {
        MatchResult::Matched {
            candidate: best,
            confidence,
            stats,
        }
    } else {
        MatchResult::NoMatch {
            reason: Rejection::BelowThreshold,
            confidence,
            stats,
        }
    }
}

/// Scores queries against a fingerprint index.
pub struct MatchScorer<'a, I: ?Sized> {
    index: &'a I,
}

impl<'a, I: FingerprintIndex + ?Sized> MatchScorer<'a, I> {
    pub fn new(index: &'a I) -> Self {
        Self { index }
    }

    pub async fn score(&self, query: &[Fingerprint], mode: Mode) -> Result<MatchResult, StoreError> {
        let profile = MatchProfile::for_mode(mode);
        let deltas = self.deltas(query).await?;

        let candidates: Vec<Candidate> = deltas
            .into_iter()
            .map(|(song_id, deltas)| Candidate::tally(song_id, &deltas, query.len(), &profile))
            .collect();

        for candidate in &candidates {
            debug!(
                song = %candidate.song_id,
                score = candidate.score,
                aligned = candidate.aligned,
                matches = candidate.matches,
                density = candidate.density,
                "candidate"
            );
        }

        Ok(decide(candidates, query.len(), &profile))
    }

    /// `query time - stored offset` for every index hit, grouped by song.
    async fn deltas(&self, query: &[Fingerprint]) -> Result<BTreeMap<SongId, Vec<f64>>, StoreError> {
        let distinct: Vec<u32> = query
            .iter()
            .map(|f| f.hash)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let hits = self.index.lookup_many(&distinct).await?;

        let mut deltas: BTreeMap<SongId, Vec<f64>> = BTreeMap::new();
        for fingerprint in query {
            for entry in hits.get(&fingerprint.hash).into_iter().flatten() {
                deltas
                    .entry(entry.song_id)
                    .or_default()
                    .push(fingerprint.time - entry.offset);
            }
        }

        Ok(deltas)
    }
}
