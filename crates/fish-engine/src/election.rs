//! Vote & Election (C2). Grounded on
//! `convex_traits::coordination::{LeaderElection, GossipState}`,
//! adapted from a persistent cluster leader to a per-Application
//! one-shot rank vote (`SPEC_FULL.md` §5.2).

use std::sync::Arc;
use std::time::Duration;

use fish_base::uid::Uid;
use fish_storage::storage::Storage;
use fish_traits::model::{Application, Vote};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::EngineResult;

/// Tunables for the election process.
#[derive(Debug, Clone, Copy)]
pub struct ElectionConfig {
    /// Base ping delay; the voting window is `2 * ping_delay`.
    pub ping_delay: Duration,
    /// Pause between rounds when no capable vote was received.
    pub grace_interval: Duration,
    /// Number of rounds with no capable vote before the Application is
    /// marked ERROR.
    pub max_rounds: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            ping_delay: Duration::from_secs(5),
            grace_interval: Duration::from_secs(5),
            max_rounds: 6,
        }
    }
}

/// Outcome of running the election to completion for one Application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// `node_uid` won; only meaningful on the node that actually won,
    /// which proceeds to write `Elected`. Every node computes the same
    /// winner from the same vote set.
    Won(Uid),
    /// Another node won.
    Lost(Uid),
    /// No node reported itself capable within `max_rounds`; caller
    /// should mark the Application ERROR.
    Exhausted,
}

/// Runs the per-Application election described in `SPEC_FULL.md` §5.2.
pub struct Election {
    storage: Arc<Storage>,
    local_node: Uid,
}

impl Election {
    pub fn new(storage: Arc<Storage>, local_node: Uid) -> Self {
        Self {
            storage,
            local_node,
        }
    }

    /// Submit this node's vote for `(application, round)` and block
    /// until the round's voting window elapses, then compute and
    /// return the winner (if any).
    ///
    /// `capable` should reflect whether this node can host the
    /// Application at the time of voting — i.e. at least one
    /// `LabelDefinition` validated and matched this node's
    /// `node_filter` (`SPEC_FULL.md` §4.2/§8).
    pub async fn run_round(
        &self,
        application: &Application,
        round: u32,
        capable: bool,
        cfg: ElectionConfig,
    ) -> EngineResult<ElectionOutcome> {
        let rank: u64 = rand::thread_rng().gen();
        let vote = Vote {
            uid: Uid::new(),
            application_uid: application.uid,
            node_uid: self.local_node,
            round,
            rank,
            capable,
            created_at: fish_base::time::now(),
        };
        self.storage.votes.put(vote.uid, vote)?;
        debug!(
            application = %application.uid,
            round,
            capable,
            "submitted vote"
        );

        tokio::time::sleep(cfg.ping_delay * 2).await;

        let winner = self.tally(application.uid, round)?;
        Ok(match winner {
            Some(node_uid) if node_uid == self.local_node => ElectionOutcome::Won(node_uid),
            Some(node_uid) => ElectionOutcome::Lost(node_uid),
            None => ElectionOutcome::Exhausted,
        })
    }

    /// Run successive rounds, sleeping `grace_interval` between
    /// rounds that found no capable vote, until a winner is found or
    /// `max_rounds` is exhausted.
    pub async fn elect(
        &self,
        application: &Application,
        capable: bool,
        cfg: ElectionConfig,
    ) -> EngineResult<ElectionOutcome> {
        for round in 0..cfg.max_rounds {
            let outcome = self.run_round(application, round, capable, cfg).await?;
            if !matches!(outcome, ElectionOutcome::Exhausted) {
                return Ok(outcome);
            }
            warn!(application = %application.uid, round, "no capable vote this round");
            tokio::time::sleep(cfg.grace_interval).await;
        }
        Ok(ElectionOutcome::Exhausted)
    }

    /// Compute the winner of a completed round: lowest rank among
    /// capable votes, ties broken by `NodeUID`.
    fn tally(&self, application_uid: Uid, round: u32) -> EngineResult<Option<Uid>> {
        let votes = self.storage.votes.list()?;
        let winner = votes
            .into_iter()
            .filter(|v| v.application_uid == application_uid && v.round == round && v.capable)
            .min_by_key(|v| (v.rank, v.node_uid))
            .map(|v| v.node_uid);
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fish_traits::model::Application;

    fn sample_application() -> Application {
        Application {
            uid: Uid::new(),
            label_uid: Uid::new(),
            metadata: serde_json::json!({}),
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        }
    }

    #[tokio::test]
    async fn lowest_rank_among_capable_wins() {
        let storage = Arc::new(Storage::memory());
        let application = sample_application();
        let winner_node = Uid::new();
        let loser_node = Uid::new();

        storage
            .votes
            .put(
                Uid::new(),
                Vote {
                    uid: Uid::new(),
                    application_uid: application.uid,
                    node_uid: winner_node,
                    round: 0,
                    rank: 1,
                    capable: true,
                    created_at: fish_base::time::now(),
                },
            )
            .unwrap();
        storage
            .votes
            .put(
                Uid::new(),
                Vote {
                    uid: Uid::new(),
                    application_uid: application.uid,
                    node_uid: loser_node,
                    round: 0,
                    rank: 2,
                    capable: true,
                    created_at: fish_base::time::now(),
                },
            )
            .unwrap();

        let election = Election::new(storage.clone(), winner_node);
        let winner = election.tally(application.uid, 0).unwrap();
        assert_eq!(winner, Some(winner_node));
    }

    #[tokio::test]
    async fn incapable_votes_never_win() {
        let storage = Arc::new(Storage::memory());
        let application = sample_application();
        let only_node = Uid::new();
        storage
            .votes
            .put(
                Uid::new(),
                Vote {
                    uid: Uid::new(),
                    application_uid: application.uid,
                    node_uid: only_node,
                    round: 0,
                    rank: 1,
                    capable: false,
                    created_at: fish_base::time::now(),
                },
            )
            .unwrap();
        let election = Election::new(storage.clone(), only_node);
        assert_eq!(election.tally(application.uid, 0).unwrap(), None);
    }

    #[tokio::test]
    async fn ties_broken_by_node_uid() {
        let storage = Arc::new(Storage::memory());
        let application = sample_application();
        let mut a = Uid::new();
        let mut b = Uid::new();
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }
        for node in [a, b] {
            storage
                .votes
                .put(
                    Uid::new(),
                    Vote {
                        uid: Uid::new(),
                        application_uid: application.uid,
                        node_uid: node,
                        round: 0,
                        rank: 5,
                        capable: true,
                        created_at: fish_base::time::now(),
                    },
                )
                .unwrap();
        }
        let election = Election::new(storage.clone(), a);
        assert_eq!(election.tally(application.uid, 0).unwrap(), Some(a));
    }
}
