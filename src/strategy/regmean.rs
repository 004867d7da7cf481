//! Closed-form regression merging of the full model.
//!
//! Clients report their full model with the input Gram matrices of the merged layers. The server
//! first averages everything with sample weights, then overwrites the weights of the merged layers
//! with their regression solution. Biases always keep the average.

use tracing::debug;

use crate::{
    aggregation::{regmean::RegMeanLayer, weights::Weighting, MergeError},
    lifecycle::TaskCounters,
    model::{Gradients, Network, Optimizer, ParameterVector, WeightOverlay, HEAD},
    payload::{ClientInfo, ClientPayload, Grams, ServerPayload},
    settings::{RegMeanSettings, StrategyKind},
    strategy::{
        average_into,
        collect_grams,
        fedavg::load_params,
        full_step,
        layer_views,
        sample_weights,
        ClientStrategy,
        RoundContext,
        ServerStrategy,
        TrainScope,
    },
};

/// The names of the layers merged by regression.
fn merged_layers<N: Network>(network: &N, head_only: bool) -> Vec<String> {
    network
        .layers()
        .iter()
        .filter(|layer| !head_only || layer.is_head())
        .map(|layer| layer.name.clone())
        .collect()
}

#[derive(Debug, Clone)]
/// A client reporting its full model with the Gram matrices of the merged layers.
pub struct RegMeanClient {
    settings: RegMeanSettings,
    grams: Grams,
}

impl RegMeanClient {
    pub fn new(settings: RegMeanSettings) -> Self {
        Self {
            settings,
            grams: Grams::new(),
        }
    }
}

impl<N: Network> ClientStrategy<N> for RegMeanClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RegMean
    }

    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError> {
        self.grams.clear();
        load_params(network, payload)
    }

    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    ) {
        full_step(network, grads, optimizer, scope)
    }

    fn end_round(&mut self, network: &N, ctx: RoundContext<'_>) -> Result<(), MergeError> {
        let layers = merged_layers(network, self.settings.head_only);
        self.grams = collect_grams(
            network,
            &WeightOverlay::new(),
            ctx.data,
            &layers,
            &self.settings,
            ctx.rng,
        );
        Ok(())
    }

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::RegMean {
            params: ParameterVector::flatten(network),
            grams: self.grams.clone(),
        }
    }
}

#[derive(Debug, Clone)]
/// A server solving the regression merge of every merged layer.
pub struct RegMeanServer {
    settings: RegMeanSettings,
}

impl RegMeanServer {
    pub fn new(settings: RegMeanSettings) -> Self {
        Self { settings }
    }
}

impl<N: Network> ServerStrategy<N> for RegMeanServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RegMean
    }

    fn server_info(&self, network: &N) -> ServerPayload {
        ServerPayload::Params {
            params: ParameterVector::flatten(network),
        }
    }

    fn merge(
        &mut self,
        network: &mut N,
        clients: &[ClientInfo],
        _counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        let reports = clients
            .iter()
            .map(|client| match &client.payload {
                ClientPayload::RegMean { params, grams } => Ok((params, grams)),
                other => Err(other.mismatch("regmean")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let previous = network.clone();
        let params: Vec<_> = reports.iter().map(|(params, _)| *params).collect();
        average_into(network, &params, &sample_weights(clients, Weighting::Samples))?;

        let views = params
            .iter()
            .map(|p| layer_views(&previous, p))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, layer) in previous.layers().iter().enumerate() {
            if self.settings.head_only && layer.name != HEAD {
                continue;
            }
            let mut regression = RegMeanLayer::new();
            for ((client, (_, grams)), client_views) in clients.iter().zip(&reports).zip(&views) {
                let gram = grams
                    .get(&layer.name)
                    .ok_or_else(|| MergeError::MissingStatistics {
                        client: client.client_id,
                        layer: layer.name.clone(),
                    })?;
                regression.try_aggregate(client_views[i].0, gram.view(), client.num_train_samples)?;
            }
            debug!("solving the regression merge of {}", layer.name);
            network.layers_mut()[i].weight =
                regression.solve(self.settings.inverse, layer.weight.view());
        }
        Ok(())
    }

    fn save_extra(&self) -> Result<Vec<u8>, bincode::Error> {
        Ok(Vec::new())
    }

    fn load_extra(&mut self, _bytes: &[u8]) -> Result<(), bincode::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::*;
    use crate::{
        aggregation::regmean::InversePolicy,
        model::{Linear, Mlp},
        strategy::tests::info,
    };

    fn network() -> Mlp {
        Mlp::from_layers(vec![Linear {
            name: HEAD.to_string(),
            weight: array![[9., 9.]],
            bias: array![0.],
        }])
    }

    fn report(params: Vec<f32>, gram: Array2<f64>) -> ClientPayload {
        ClientPayload::RegMean {
            params: ParameterVector::from(params),
            grams: vec![(HEAD.to_string(), gram)].into_iter().collect(),
        }
    }

    #[test]
    fn test_each_feature_follows_the_clients_that_saw_it() {
        for &inverse in &[InversePolicy::Inverse, InversePolicy::PseudoInverse] {
            let mut net = network();
            let mut server = RegMeanServer::new(RegMeanSettings {
                inverse,
                ..RegMeanSettings::default()
            });
            let clients = vec![
                info(0, 10, report(vec![1., 5., 2.], array![[2., 0.], [0., 0.]])),
                info(1, 10, report(vec![7., 3., 4.], array![[0., 0.], [0., 2.]])),
            ];
            server
                .merge(&mut net, &clients, &TaskCounters::new())
                .unwrap();
            let head = net.head();
            assert!((head.weight[[0, 0]] - 1.).abs() < 1e-5);
            assert!((head.weight[[0, 1]] - 3.).abs() < 1e-5);
            // biases are averaged
            assert!((head.bias[0] - 3.).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_grams_keep_the_previous_weight() {
        let mut net = network();
        let mut server = RegMeanServer::new(RegMeanSettings::default());
        let clients = vec![
            info(0, 10, report(vec![1., 5., 2.], Array2::zeros((2, 2)))),
            info(1, 0, report(vec![7., 3., 4.], Array2::zeros((2, 2)))),
        ];
        server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap();
        assert_eq!(net.head().weight, array![[9., 9.]]);
        assert!(net.head().weight.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_missing_gram_is_reported() {
        let mut net = network();
        let mut server = RegMeanServer::new(RegMeanSettings::default());
        let clients = vec![info(
            3,
            10,
            ClientPayload::RegMean {
                params: ParameterVector::from(vec![1., 1., 1.]),
                grams: Grams::new(),
            },
        )];
        let err = server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap_err();
        assert!(matches!(err, MergeError::MissingStatistics { client: 3, .. }));
    }

    #[test]
    fn test_client_grams_are_damped() {
        let net = network();
        let mut client = RegMeanClient::new(RegMeanSettings {
            alpha_head: 0.5,
            ..RegMeanSettings::default()
        });
        let data = crate::data::ClientDataset::new(array![[1., 2.], [3., 4.]], vec![0, 0]);
        let mut rng = rand::SeedableRng::seed_from_u64(0);
        let seen = Default::default();
        ClientStrategy::<Mlp>::end_round(
            &mut client,
            &net,
            RoundContext {
                data: &data,
                window: crate::model::TaskWindow::new(0, 1),
                scheme: crate::model::LabelScheme::Offset,
                rng: &mut rng,
                seen: &seen,
            },
        )
        .unwrap();
        // XᵀX = [[10, 14], [14, 20]], off-diagonals halved
        assert_eq!(client.grams[HEAD], array![[10., 7.], [7., 20.]]);
    }
}
