//! Class-aware averaging of the full model.
//!
//! The backbone is averaged with sample weights, optionally blended with label entropy weights,
//! or with gradient importance weights. The head is then re-patched row by row with per-class
//! client weights, so that every class row comes from the clients which actually hold that class.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, Ix1};
use tracing::{debug, warn};

use crate::{
    aggregation::{
        average::{ElementwiseAverage, WeightedAverage},
        gradient::{layer_weights, parameter_weights, Granularity, SmallOmega},
        mixture::{class_statistics, ClassStatistics},
        weights::{class_weights, entropy_weights, ClientWeights},
        MergeError,
    },
    lifecycle::TaskCounters,
    model::{Gradients, Linear, Network, Optimizer, ParameterVector, ShapeMismatch, WeightOverlay},
    payload::{ClientInfo, ClientPayload, ServerPayload},
    settings::{CocoAvgSettings, GradientSettings, StrategyKind},
    strategy::{
        average_into,
        check_len,
        fedavg::load_params,
        flatten_gradients,
        full_step,
        layer_views,
        sample_weights,
        ClientStrategy,
        RoundContext,
        ServerStrategy,
        TrainScope,
    },
};

#[derive(Debug, Clone)]
/// A client reporting its full model with class and gradient statistics.
pub struct CocoAvgClient {
    settings: CocoAvgSettings,
    small_omega: Option<SmallOmega>,
    class_counts: BTreeMap<usize, usize>,
    class_statistics: BTreeMap<usize, ClassStatistics>,
}

impl CocoAvgClient {
    pub fn new<N: Network>(settings: CocoAvgSettings, network: &N) -> Self {
        let small_omega = settings
            .gradient
            .map(|_| SmallOmega::zeros(network.num_parameters()));
        Self {
            settings,
            small_omega,
            class_counts: BTreeMap::new(),
            class_statistics: BTreeMap::new(),
        }
    }
}

impl<N: Network> ClientStrategy<N> for CocoAvgClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CocoAvg
    }

    fn begin_task(&mut self, _network: &N, _counters: &TaskCounters) {
        if let Some(omega) = self.small_omega.as_mut() {
            omega.reset();
        }
    }

    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError> {
        load_params(network, payload)?;
        if let Some(omega) = self.small_omega.as_mut() {
            omega.reset();
        }
        Ok(())
    }

    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    ) {
        match self.small_omega.as_mut() {
            Some(omega) => {
                let before = ParameterVector::flatten(network);
                full_step(network, grads, optimizer, scope);
                let after = ParameterVector::flatten(network);
                omega.accumulate(
                    0,
                    flatten_gradients(grads).view(),
                    ArrayView1::from(before.as_slice()),
                    ArrayView1::from(after.as_slice()),
                );
            }
            None => full_step(network, grads, optimizer, scope),
        }
    }

    fn end_round(&mut self, network: &N, ctx: RoundContext<'_>) -> Result<(), MergeError> {
        self.class_counts = ctx.data.class_counts();
        let pass = network.forward(ctx.data.inputs.view(), &WeightOverlay::new());
        self.class_statistics = class_statistics(pass.features().view(), &ctx.data.labels, false);
        Ok(())
    }

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::ClassAware {
            params: ParameterVector::flatten(network),
            class_counts: self.class_counts.clone(),
            class_statistics: self.class_statistics.clone(),
            small_omega: self
                .small_omega
                .as_ref()
                .map(|omega| omega.values().to_vec()),
        }
    }

    fn linear_probe_epochs(&self) -> usize {
        self.settings.linear_probe_epochs
    }
}

struct Report<'a> {
    params: &'a ParameterVector,
    class_counts: &'a BTreeMap<usize, usize>,
    class_statistics: &'a BTreeMap<usize, ClassStatistics>,
    small_omega: Option<&'a Vec<f32>>,
}

fn reports(clients: &[ClientInfo]) -> Result<Vec<Report<'_>>, MergeError> {
    clients
        .iter()
        .map(|client| match &client.payload {
            ClientPayload::ClassAware {
                params,
                class_counts,
                class_statistics,
                small_omega,
            } => Ok(Report {
                params,
                class_counts,
                class_statistics,
                small_omega: small_omega.as_ref(),
            }),
            other => Err(other.mismatch("class_aware")),
        })
        .collect()
}

#[derive(Debug, Clone)]
/// A server merging the backbone by sample, entropy or gradient weights and the head per class.
pub struct CocoAvgServer {
    settings: CocoAvgSettings,
}

impl CocoAvgServer {
    pub fn new(settings: CocoAvgSettings) -> Self {
        Self { settings }
    }

    fn client_weights(&self, clients: &[ClientInfo], reports: &[Report]) -> ClientWeights {
        let weights = sample_weights(clients, self.settings.weighting);
        match self.settings.entropy_beta {
            Some(beta) if beta > 0. => {
                let histograms: Vec<_> = reports.iter().map(|r| r.class_counts).collect();
                weights.blend(&entropy_weights(&histograms), beta)
            }
            _ => weights,
        }
    }
}

/// Merges the full parameter vectors with gradient importance weights.
fn gradient_merge<N: Network>(
    network: &mut N,
    reports: &[Report],
    weights: &ClientWeights,
    gradient: GradientSettings,
) -> Result<(), MergeError> {
    let len = network.num_parameters();
    let zeros = Array1::<f32>::zeros(len);
    let mut omegas = Vec::with_capacity(reports.len());
    for report in reports {
        check_len(network, report.params)?;
        match report.small_omega {
            Some(omega) if omega.len() != len => {
                return Err(ShapeMismatch {
                    expected: len,
                    actual: omega.len(),
                }
                .into())
            }
            Some(omega) => omegas.push(ArrayView1::from(omega.as_slice())),
            None => {
                debug!("missing gradient importance: counted as zero");
                omegas.push(zeros.view());
            }
        }
    }

    let merged: Vec<f32> = match gradient.granularity {
        Granularity::PerParameter => {
            let mut average = ElementwiseAverage::<Ix1>::new();
            let param_weights = parameter_weights(&omegas, weights, gradient.gamma_gr_numcl);
            for (report, w) in reports.iter().zip(param_weights) {
                average.try_aggregate(w.view(), ArrayView1::from(report.params.as_slice()))?;
            }
            match average.average() {
                Some(merged) => merged.to_vec(),
                None => return Ok(()),
            }
        }
        Granularity::PerLayer => {
            let ranges: Vec<_> = ParameterVector::layer_ranges(network)
                .into_iter()
                .map(|(_, range)| range)
                .collect();
            let per_layer = layer_weights(&omegas, &ranges, weights, gradient.gamma_gr_numcl);
            let mut merged = ParameterVector::flatten(network).as_slice().to_vec();
            for (range, layer_weights) in ranges.iter().zip(per_layer) {
                let mut average = WeightedAverage::<Ix1>::new();
                for (report, &w) in reports.iter().zip(layer_weights.iter()) {
                    let slice = &report.params.as_slice()[range.clone()];
                    average.try_aggregate(w, ArrayView1::from(slice))?;
                }
                if let Some(layer) = average.average() {
                    for (dst, src) in merged[range.clone()].iter_mut().zip(layer.iter()) {
                        *dst = *src;
                    }
                }
            }
            merged
        }
    };
    ParameterVector::from(merged).unflatten(network)?;
    Ok(())
}

/// Reassembles the head row by row with per-class client weights.
///
/// Rows of classes no client holds keep the values of `previous`.
fn class_weighted_head<N: Network>(
    network: &N,
    reports: &[Report],
    previous: &Linear,
    alpha: f64,
) -> Result<(Array2<f32>, Array1<f32>), MergeError> {
    let num_classes = network.num_classes();
    let mut heads = Vec::with_capacity(reports.len());
    for report in reports {
        let mut views = layer_views(network, report.params)?;
        if let Some(head) = views.pop() {
            heads.push(head);
        }
    }

    let counts: Vec<Vec<f64>> = reports
        .iter()
        .map(|r| {
            (0..num_classes)
                .map(|c| r.class_counts.get(&c).copied().unwrap_or(0) as f64)
                .collect()
        })
        .collect();
    let variances: Vec<Vec<f64>> = reports
        .iter()
        .map(|r| {
            (0..num_classes)
                .map(|c| {
                    r.class_statistics
                        .get(&c)
                        .map(|s| s.covariance.trace())
                        .unwrap_or(0.)
                })
                .collect()
        })
        .collect();
    let per_class = class_weights(&counts, &variances, num_classes, alpha);

    let mut weight = previous.weight.clone();
    let mut bias = previous.bias.clone();
    for class in (0..num_classes).filter(|&c| per_class.covered[c]) {
        let mut row = Array1::<f64>::zeros(weight.ncols());
        let mut b = 0.;
        for (client, (w, client_bias)) in heads.iter().enumerate() {
            let share = per_class.weights[[class, client]];
            row.scaled_add(share, &w.row(class).mapv(f64::from));
            b += share * f64::from(client_bias[class]);
        }
        weight.row_mut(class).assign(&row.mapv(|x| x as f32));
        bias[class] = b as f32;
    }
    let uncovered = per_class.covered.iter().filter(|c| !**c).count();
    if uncovered > 0 {
        debug!("{} head rows without any client keep their previous values", uncovered);
    }
    Ok((weight, bias))
}

impl<N: Network> ServerStrategy<N> for CocoAvgServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CocoAvg
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
        let reports = reports(clients)?;
        let weights = self.client_weights(clients, &reports);
        let previous = network.head().clone();

        match self.settings.gradient {
            Some(gradient) => gradient_merge(network, &reports, &weights, gradient)?,
            None => {
                let params: Vec<_> = reports.iter().map(|r| r.params).collect();
                average_into(network, &params, &weights)?
            }
        }

        if let Some(alpha) = self.settings.alpha_sample_classes {
            let (weight, bias) = class_weighted_head(network, &reports, &previous, alpha)?;
            if weight.iter().any(|x| !x.is_finite()) {
                warn!("class weighted head is not finite: keeping the averaged head");
            } else {
                let head = network.head_mut();
                head.weight = weight;
                head.bias = bias;
            }
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
    use ndarray::array;

    use super::*;
    use crate::{
        aggregation::{mixture::Covariance, weights::Weighting},
        model::{Mlp, HEAD},
        strategy::tests::info,
    };

    /// A bare `3 x 2` head.
    fn network() -> Mlp {
        Mlp::from_layers(vec![Linear {
            name: HEAD.to_string(),
            weight: array![[0., 0.], [0., 0.], [7., 7.]],
            bias: array![0., 0., 7.],
        }])
    }

    fn stats(variance: f64) -> ClassStatistics {
        ClassStatistics {
            count: 10,
            mean: array![0., 0.],
            covariance: Covariance::Diagonal(array![variance, variance]),
        }
    }

    fn report(params: Vec<f32>, class: usize, variance: f64) -> ClientPayload {
        ClientPayload::ClassAware {
            params: ParameterVector::from(params),
            class_counts: vec![(class, 10)].into_iter().collect(),
            class_statistics: vec![(class, stats(variance))].into_iter().collect(),
            small_omega: None,
        }
    }

    #[test]
    fn test_head_rows_come_from_the_class_owners() {
        let mut net = network();
        let mut server = CocoAvgServer::new(CocoAvgSettings {
            alpha_sample_classes: Some(0.5),
            ..CocoAvgSettings::default()
        });
        // weight rows then bias
        let a = vec![1., 2., 3., 4., 5., 6., 0.1, 0.2, 0.3];
        let b = vec![-1., -2., -3., -4., -5., -6., -0.1, -0.2, -0.3];
        let clients = vec![info(0, 10, report(a, 0, 1.)), info(1, 10, report(b, 1, 4.))];
        server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap();

        let head = net.head();
        assert_eq!(head.weight.row(0), array![1., 2.]);
        assert_eq!(head.weight.row(1), array![-3., -4.]);
        assert!((head.bias[0] - 0.1).abs() < 1e-6);
        assert!((head.bias[1] + 0.2).abs() < 1e-6);
        // nobody holds class 2
        assert_eq!(head.weight.row(2), array![7., 7.]);
        assert_eq!(head.bias[2], 7.);
    }

    #[test]
    fn test_parameter_gradient_weights_follow_the_importance() {
        let mut net = crate::strategy::tests::tiny();
        let mut server = CocoAvgServer::new(CocoAvgSettings {
            gradient: Some(GradientSettings {
                granularity: Granularity::PerParameter,
                gamma_gr_numcl: 0.,
            }),
            ..CocoAvgSettings::default()
        });
        let payload = |params: Vec<f32>, omega: Vec<f32>| ClientPayload::ClassAware {
            params: ParameterVector::from(params),
            class_counts: BTreeMap::new(),
            class_statistics: BTreeMap::new(),
            small_omega: Some(omega),
        };
        let clients = vec![
            info(0, 10, payload(vec![1., 1.], vec![1., 0.])),
            info(1, 10, payload(vec![3., 3.], vec![0., 1.])),
        ];
        server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap();
        assert_eq!(ParameterVector::flatten(&net), ParameterVector::from(vec![1., 3.]));
    }

    #[test]
    fn test_layer_gradient_weights_without_importance_are_uniform() {
        let mut net = crate::strategy::tests::tiny();
        let mut server = CocoAvgServer::new(CocoAvgSettings {
            weighting: Weighting::Samples,
            gradient: Some(GradientSettings {
                granularity: Granularity::PerLayer,
                gamma_gr_numcl: 0.5,
            }),
            ..CocoAvgSettings::default()
        });
        let payload = |params: Vec<f32>| ClientPayload::ClassAware {
            params: ParameterVector::from(params),
            class_counts: BTreeMap::new(),
            class_statistics: BTreeMap::new(),
            small_omega: Some(vec![0., 0.]),
        };
        let clients = vec![
            info(0, 30, payload(vec![1., 1.])),
            info(1, 10, payload(vec![3., 3.])),
        ];
        server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap();
        assert_eq!(ParameterVector::flatten(&net), ParameterVector::from(vec![2., 2.]));
    }

    #[test]
    fn test_client_accumulates_small_omega() {
        let mut net = crate::strategy::tests::tiny();
        let mut client = CocoAvgClient::new(
            CocoAvgSettings {
                gradient: Some(GradientSettings {
                    granularity: Granularity::PerParameter,
                    gamma_gr_numcl: 0.,
                }),
                ..CocoAvgSettings::default()
            },
            &net,
        );
        let grads = Gradients {
            weights: vec![array![[2.]]],
            biases: vec![array![-1.]],
        };
        let mut optimizer = Optimizer::sgd(0.5, 0.);
        client.step(&mut net, &grads, &mut optimizer, TrainScope::Full);
        match ClientStrategy::<Mlp>::client_info(&client, &net) {
            // g * (before - after) = g * lr * g
            ClientPayload::ClassAware { small_omega, .. } => {
                assert_eq!(small_omega, Some(vec![2., 0.5]))
            }
            other => panic!("unexpected payload {}", other.schema()),
        }
    }
}
