//! Contest standings: competition ranking, podium and trophy tallies.
//!
//! Everything here is a pure function over a snapshot of entries and their
//! like counts; the store is responsible for producing a consistent snapshot.
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Lowest rank that still earns a podium place.
pub const PODIUM_DEPTH: u32 = 3;

/// One contest entry as seen by the ranking code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInput {
    pub entry_id: i64,
    pub contest_id: i64,
    pub user_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub like_count: i64,
}

/// Snapshot of a single contest's entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContestStanding {
    pub contest_id: i64,
    pub end_date: DateTime<Utc>,
    pub entries: Vec<RankInput>,
}

impl ContestStanding {
    pub fn is_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.end_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedEntry {
    pub entry: RankInput,
    pub rank: u32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Medal {
    #[display(fmt = "gold")]
    Gold,
    #[display(fmt = "silver")]
    Silver,
    #[display(fmt = "bronze")]
    Bronze,
}

impl Medal {
    pub fn for_rank(rank: u32) -> Option<Self> {
        match rank {
            1 => Some(Medal::Gold),
            2 => Some(Medal::Silver),
            3 => Some(Medal::Bronze),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodiumEntry {
    pub entry: RankInput,
    pub rank: u32,
    pub medal: Medal,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
pub struct TrophyTally {
    pub gold: u32,
    pub silver: u32,
    pub bronze: u32,
}

impl TrophyTally {
    pub fn record(&mut self, medal: Medal) {
        match medal {
            Medal::Gold => self.gold += 1,
            Medal::Silver => self.silver += 1,
            Medal::Bronze => self.bronze += 1,
        }
    }
}

impl Add for TrophyTally {
    type Output = TrophyTally;

    fn add(self, rhs: Self) -> Self::Output {
        TrophyTally {
            gold: self.gold + rhs.gold,
            silver: self.silver + rhs.silver,
            bronze: self.bronze + rhs.bronze,
        }
    }
}

impl AddAssign for TrophyTally {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for TrophyTally {
    fn sum<I: Iterator<Item = TrophyTally>>(iter: I) -> Self {
        iter.fold(TrophyTally::default(), Add::add)
    }
}

// Entry id is the last key so that fully tied entries still iterate in a
// stable order.
fn standing_order(a: &RankInput, b: &RankInput) -> Ordering {
    b.like_count
        .cmp(&a.like_count)
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        .then_with(|| a.entry_id.cmp(&b.entry_id))
}

/// Sorts one contest's entries into standing order and attaches RANK()-style
/// ranks: equal like counts share a rank, and the next distinct count takes
/// its 1-based position (5,5,3 -> 1,1,3).
pub fn rank_entries(entries: &[RankInput]) -> Vec<RankedEntry> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(standing_order);

    let mut ranked = Vec::with_capacity(sorted.len());
    let mut previous: Option<(i64, u32)> = None;
    for (idx, entry) in sorted.into_iter().enumerate() {
        let rank = match previous {
            Some((likes, rank)) if likes == entry.like_count => rank,
            _ => idx as u32 + 1,
        };
        previous = Some((entry.like_count, rank));
        ranked.push(RankedEntry { entry, rank });
    }
    ranked
}

pub fn assign_ranks(entries: &[RankInput]) -> HashMap<i64, u32> {
    rank_entries(entries)
        .into_iter()
        .map(|ranked| (ranked.entry.entry_id, ranked.rank))
        .collect()
}

/// Counts the user's podium finishes across the given ended contests.
///
/// Finishes are counted per entry: two entries of the same user sharing rank 1
/// in one contest add two golds.
pub fn tally_trophies(user_id: i64, ended_contests: &[ContestStanding]) -> TrophyTally {
    ended_contests
        .iter()
        .map(|contest| tally_contest(user_id, contest))
        .sum()
}

fn tally_contest(user_id: i64, contest: &ContestStanding) -> TrophyTally {
    let mut tally = TrophyTally::default();
    for ranked in rank_entries(&contest.entries) {
        if ranked.entry.user_id != user_id {
            continue;
        }
        if let Some(medal) = Medal::for_rank(ranked.rank) {
            tally.record(medal);
        }
    }
    tally
}

/// Podium for one contest: every entry ranked 1..=3, tie groups kept whole,
/// ordered by rank then submission time. Medals follow the numeric rank, so
/// two tied winners both get gold and the next entry (rank 3) gets bronze.
pub fn winners(contest_entries: &[RankInput]) -> Vec<PodiumEntry> {
    rank_entries(contest_entries)
        .into_iter()
        .take_while(|ranked| ranked.rank <= PODIUM_DEPTH)
        .filter_map(|ranked| {
            Medal::for_rank(ranked.rank).map(|medal| PodiumEntry {
                entry: ranked.entry,
                rank: ranked.rank,
                medal,
            })
        })
        .collect()
}
