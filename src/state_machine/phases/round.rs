use rand::{seq::index, Rng};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    client::{ClientModel, TrainError},
    model::Network,
    payload::ClientInfo,
    state_machine::{
        phases::{EndTask, Phase, PhaseError, PhaseName, PhaseState, Shared},
        RoundAccuracy,
        StateMachine,
    },
};

/// The communication round state.
#[derive(Debug, Default)]
pub struct Round {
    /// The ids of the clients sampled for the round.
    participants: Vec<usize>,
    /// The accuracy of the merged model on every seen task.
    accuracy: Option<Vec<f64>>,
}

impl<N: Network + 'static> Phase<N> for PhaseState<Round, N> {
    const NAME: PhaseName = PhaseName::Round;

    /// Trains the sampled clients on the broadcast global state and merges their reports.
    fn process(&mut self) -> Result<(), PhaseError> {
        let shared = &mut self.shared;
        shared.server.begin_round_server()?;
        let info = shared.server.get_server_info()?;

        let participants = sample_participants(
            shared.clients.len(),
            shared.federation.participation,
            &mut shared.rng,
        );
        debug!("sampled clients {:?}", participants);

        let data = &shared.data;
        let (epochs, batch_size) = (shared.federation.epochs, shared.federation.batch_size);
        let train = |client: &mut ClientModel<N>| -> Result<ClientInfo, TrainError> {
            let local = data.train_set(info.task, client.id());
            client.run_round(&info, &local, epochs, batch_size)
        };
        let sampled = |client: &&mut ClientModel<N>| participants.binary_search(&client.id()).is_ok();
        let reports = if shared.federation.parallel_clients {
            shared
                .clients
                .par_iter_mut()
                .filter(sampled)
                .map(train)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            shared
                .clients
                .iter_mut()
                .filter(sampled)
                .map(train)
                .collect::<Result<Vec<_>, _>>()?
        };

        shared.server.end_round_server(&reports)?;
        if shared.federation.evaluate {
            self.private.accuracy = Some(shared.server.evaluate(shared.data.as_ref()));
        }
        self.private.participants = participants;
        Ok(())
    }

    fn broadcast(&mut self) {
        let task = self.shared.server.counters().cur_task().unwrap_or(0);
        let round = self.shared.server.round();
        if let Some(per_task) = self.private.accuracy.take() {
            let mean = per_task.iter().sum::<f64>() / per_task.len().max(1) as f64;
            info!(
                "task {} round {}: {} clients, mean accuracy {:.4} over tasks {:?}",
                task,
                round,
                self.private.participants.len(),
                mean,
                per_task
            );
            self.shared.report.accuracies.push(RoundAccuracy {
                task,
                round,
                per_task,
            });
        }
    }

    fn next(self) -> Option<StateMachine<N>> {
        Some(if self.shared.server.round() < self.shared.federation.rounds {
            PhaseState::<Round, _>::new(self.shared).into()
        } else {
            PhaseState::<EndTask, _>::new(self.shared).into()
        })
    }
}

impl<N: Network> PhaseState<Round, N> {
    /// Creates a new round state.
    pub fn new(shared: Shared<N>) -> Self {
        Self {
            private: Round::default(),
            shared,
        }
    }
}

/// Samples `ceil(fraction * clients)` distinct clients, at least one, in ascending order.
pub(in crate::state_machine) fn sample_participants<R: Rng>(
    clients: usize,
    fraction: f64,
    rng: &mut R,
) -> Vec<usize> {
    if clients == 0 {
        return Vec::new();
    }
    let amount = ((fraction * clients as f64).ceil() as usize).max(1).min(clients);
    if amount == clients {
        return (0..clients).collect();
    }
    let mut sampled = index::sample(rng, clients, amount).into_vec();
    sampled.sort_unstable();
    sampled
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn test_full_participation() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        assert_eq!(sample_participants(4, 1., &mut rng), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_partial_participation() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let sampled = sample_participants(10, 0.25, &mut rng);
        assert_eq!(sampled.len(), 3);
        assert!(sampled.windows(2).all(|w| w[0] < w[1]));
        assert!(sampled.iter().all(|&id| id < 10));
        assert_eq!(sample_participants(10, 0.01, &mut rng).len(), 1);
    }

    #[test]
    fn test_sampling_is_seeded() {
        let sample = |seed| sample_participants(20, 0.3, &mut ChaCha20Rng::seed_from_u64(seed));
        assert_eq!(sample(7), sample(7));
    }
}
