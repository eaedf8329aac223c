use spatial_occupancy::{
    BatchSchedule, ChainOptions, CommunitySamples, CommunitySimulation, ConfigurationError,
    CrossValidationOptions, FitStatistic, LoadingsMask, NewSites, OccupancyError, PpcGrouping,
    SamplerConfig, SpatialConfig, community_posterior_predictive_check, community_waic,
    cross_validate_community, fit_community, predict_community, simulate_community,
};

fn community_config(spatial: bool, n_factors: usize) -> SamplerConfig {
    SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 40,
            batch_length: 10,
            n_burn: 200,
            n_thin: 2,
            seed: 55,
        },
        chains: ChainOptions {
            chains: 2,
            ..ChainOptions::default()
        },
        spatial: spatial.then(|| SpatialConfig {
            neighbors: 6,
            ..SpatialConfig::default()
        }),
        n_factors,
        ..SamplerConfig::default()
    }
}

#[test]
fn spatial_factor_fit_respects_loading_constraints() {
    let data = simulate_community(&CommunitySimulation::default(), 1).expect("simulation");
    let (model, report, samples) =
        fit_community(&data.input, &community_config(true, 2)).expect("fit");
    assert_eq!(model.n_species, 6);
    assert_eq!(model.n_factors, 2);

    let mask = LoadingsMask::new(model.n_species, model.n_factors);
    for draw in samples.iter().flat_map(|chain| &chain.draws) {
        assert_eq!(draw.loadings.len(), 6);
        assert!((draw.loadings[0][0] - 1.0).abs() < f64::EPSILON);
        assert!(draw.loadings[0][1].abs() < f64::EPSILON);
        assert!((draw.loadings[1][1] - 1.0).abs() < f64::EPSILON);
        let mut constrained = draw.loadings.clone();
        mask.apply(&mut constrained);
        assert_eq!(constrained, draw.loadings);
        assert_eq!(draw.factors.len(), 2);
        assert!(draw.factors.iter().all(|field| field.len() == 40));
        assert!(draw.beta_variance.iter().all(|variance| *variance > 0.0));
        for (species, states) in draw.z.iter().enumerate() {
            for (unit, state) in states.iter().enumerate() {
                if data.input.detections[species].unit_detected(unit) {
                    assert_eq!(*state, 1);
                }
            }
        }
    }

    let convergence = report.convergence.expect("two chains");
    for name in ["beta_mean[0]", "beta_variance[1]", "alpha_mean[0]", "phi[0]", "phi[1]"] {
        let parameter = convergence.get(name).expect("community diagnostic");
        assert!(!parameter.split_rhat.is_nan(), "{name} R-hat is NaN");
    }
    assert_eq!(report.pooled_summary.loadings.len(), 6);
    assert_eq!(report.pooled_summary.richness.len(), 40);
}

#[test]
fn community_fit_rejects_more_factors_than_species() {
    let data = simulate_community(&CommunitySimulation::default(), 2).expect("simulation");
    assert!(matches!(
        fit_community(&data.input, &community_config(true, 7)),
        Err(OccupancyError::Configuration(ConfigurationError::InvalidFactorCount {
            factors: 7,
            species: 6
        }))
    ));
}

#[test]
fn community_assessment_covers_every_species() {
    let settings = CommunitySimulation {
        n_factors: 0,
        ..CommunitySimulation::default()
    };
    let data = simulate_community(&settings, 3).expect("simulation");
    let (model, _, samples) = fit_community(&data.input, &community_config(false, 0)).expect("fit");
    let pooled = CommunitySamples::pooled(&samples);

    let checks = community_posterior_predictive_check(
        &pooled,
        &data.input,
        FitStatistic::ChiSquared,
        PpcGrouping::Replicate,
        4,
    )
    .expect("ppc");
    assert_eq!(checks.len(), 6);
    assert!(
        checks
            .iter()
            .all(|check| (0.0..=1.0).contains(&check.bayesian_p_value))
    );

    let criteria = community_waic(&pooled, &data.input).expect("waic");
    assert!(criteria.iter().all(|species| species.waic.is_finite()));

    let new_sites = NewSites::new(data.input.occupancy_design.clone(), 1);
    let prediction = predict_community(&model, &pooled, &new_sites, 5).expect("prediction");
    assert_eq!(prediction.psi_mean.len(), 6);
    assert!(prediction.psi_mean.iter().all(|species| species.len() == 40));
    assert!(prediction.factors.is_empty());
}

#[test]
fn spatial_community_cross_validation_runs() {
    let data = simulate_community(&CommunitySimulation::default(), 6).expect("simulation");
    let config = SamplerConfig {
        chains: ChainOptions {
            chains: 1,
            ..ChainOptions::default()
        },
        ..community_config(true, 1)
    };
    let result = cross_validate_community(
        &data.input,
        &config,
        CrossValidationOptions {
            k_folds: 4,
            seed: 12,
        },
    )
    .expect("cv");
    assert_eq!(result.fold_deviance.len(), 4);
    assert!(result.total_deviance.is_finite());
}
