use spatial_occupancy::{
    BatchSchedule, ChainOptions, FitStatistic, OccupancyError, OccupancySamples,
    OccupancySimulation, PpcGrouping, RandomEffectTruth, SamplerConfig, fit_occupancy,
    in_sample_deviance, posterior_predictive_check, simulate_occupancy, waic,
};

fn scenario_config() -> SamplerConfig {
    SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 400,
            batch_length: 25,
            n_burn: 5000,
            n_thin: 5,
            seed: 2024,
        },
        chains: ChainOptions {
            chains: 3,
            ..ChainOptions::default()
        },
        ..SamplerConfig::default()
    }
}

fn scenario_data() -> OccupancySimulation {
    OccupancySimulation {
        n_sites: 50,
        n_seasons: 1,
        n_replicates: 4,
        beta: vec![0.4, 0.9, -0.7],
        alpha: vec![0.2, 0.6, -0.5, 0.3],
        missing_rate: 0.0,
        ..OccupancySimulation::default()
    }
}

#[test]
fn scenario_retains_one_thousand_draws_per_chain() {
    let data = simulate_occupancy(&scenario_data(), 11).expect("simulation");
    assert_eq!(data.input.detections.observed_cells(), 200);

    let (model, report, samples) = fit_occupancy(&data.input, &scenario_config()).expect("fit");
    assert_eq!(model.n_occupancy_covariates, 3);
    assert_eq!(model.n_detection_covariates, 4);
    assert_eq!(samples.len(), 3);
    assert!(samples.iter().all(|chain| chain.len() == 1000));
    assert!(report.chains.iter().all(|chain| chain.retained_draws == 1000));

    let pooled = OccupancySamples::pooled(&samples);
    assert_eq!(pooled.len(), 3000);
    assert_eq!(report.pooled_summary.draw_count, 3000);

    for draw in &pooled.draws {
        for (unit, state) in draw.z.iter().enumerate() {
            if data.input.detections.unit_detected(unit) {
                assert_eq!(*state, 1, "detected unit {unit} must stay occupied");
            }
        }
    }

    let criteria = waic(&pooled, &data.input).expect("waic");
    assert!(criteria.waic.is_finite());
    let deviance = in_sample_deviance(&pooled, &data.input).expect("deviance");
    assert!((criteria.waic - (deviance + 2.0 * criteria.p_waic)).abs() < 1e-8);

    let convergence = report.convergence.expect("three chains give convergence");
    assert_eq!(convergence.chain_count, 3);
    for name in ["beta[0]", "beta[1]", "beta[2]", "alpha[0]", "alpha[3]"] {
        let parameter = convergence.get(name).expect("coefficient diagnostic");
        assert!(!parameter.split_rhat.is_nan(), "{name} R-hat is NaN");
        assert!(parameter.effective_sample_size > 0.0);
    }
    assert!(convergence.max_split_rhat.is_some_and(|rhat| rhat < 1.2));
}

#[test]
fn retained_draws_follow_the_schedule_arithmetic() {
    let data = simulate_occupancy(&OccupancySimulation::default(), 12).expect("simulation");
    for (n_batch, batch_length, n_burn, n_thin) in [(10, 20, 50, 3), (7, 13, 0, 4), (5, 10, 49, 1)]
    {
        let config = SamplerConfig {
            schedule: BatchSchedule {
                n_batch,
                batch_length,
                n_burn,
                n_thin,
                seed: 3,
            },
            chains: ChainOptions {
                chains: 1,
                ..ChainOptions::default()
            },
            ..SamplerConfig::default()
        };
        let (_, _, samples) = fit_occupancy(&data.input, &config).expect("fit");
        assert_eq!(samples[0].len(), (n_batch * batch_length - n_burn) / n_thin);
    }
}

#[test]
fn schedule_without_retained_draws_is_rejected_before_sampling() {
    let data = simulate_occupancy(&OccupancySimulation::default(), 13).expect("simulation");
    let config = SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 200,
            batch_length: 25,
            n_burn: 5000,
            n_thin: 5,
            seed: 1,
        },
        ..SamplerConfig::default()
    };
    assert!(matches!(
        fit_occupancy(&data.input, &config),
        Err(OccupancyError::Configuration(_))
    ));
}

#[test]
fn correctly_specified_model_passes_posterior_predictive_checks() {
    let config = SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 60,
            batch_length: 25,
            n_burn: 500,
            n_thin: 2,
            seed: 77,
        },
        chains: ChainOptions {
            chains: 1,
            ..ChainOptions::default()
        },
        ..SamplerConfig::default()
    };
    let mut within = 0;
    for seed in [31, 32, 33] {
        let data = simulate_occupancy(&OccupancySimulation::default(), seed).expect("simulation");
        let (_, _, samples) = fit_occupancy(&data.input, &config).expect("fit");
        let check = posterior_predictive_check(
            &samples[0],
            &data.input,
            FitStatistic::FreemanTukey,
            PpcGrouping::Site,
            seed,
        )
        .expect("ppc");
        assert_eq!(check.fit_observed.len(), samples[0].len());
        if (0.1..=0.9).contains(&check.bayesian_p_value) {
            within += 1;
        }
    }
    assert!(within >= 2, "only {within} of 3 p-values fell in [0.1, 0.9]");
}

#[test]
fn random_intercepts_are_sampled_with_positive_variances() {
    let settings = OccupancySimulation {
        n_sites: 60,
        occupancy_effect: Some(RandomEffectTruth {
            n_levels: 6,
            variance: 0.8,
        }),
        detection_effect: Some(RandomEffectTruth {
            n_levels: 4,
            variance: 0.5,
        }),
        ..OccupancySimulation::default()
    };
    let data = simulate_occupancy(&settings, 14).expect("simulation");
    let config = SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 40,
            batch_length: 10,
            n_burn: 200,
            n_thin: 2,
            seed: 8,
        },
        ..SamplerConfig::default()
    };
    let (_, report, samples) = fit_occupancy(&data.input, &config).expect("fit");
    for draw in &samples[0].draws {
        assert_eq!(draw.occupancy_effects.len(), 1);
        assert_eq!(draw.occupancy_effects[0].len(), 6);
        assert_eq!(draw.detection_effects[0].len(), 4);
        assert!(draw.occupancy_effect_variances[0] > 0.0);
        assert!(draw.detection_effect_variances[0] > 0.0);
    }
    assert_eq!(report.pooled_summary.occupancy_effect_variances.len(), 1);
    let convergence = report.convergence.expect("default runs three chains");
    assert!(convergence.get("occupancy_effect_variance[0]").is_some());
}

#[test]
fn configuration_round_trips_through_toml() {
    let config = SamplerConfig::from_toml_str(
        r"
        n_factors = 2

        [schedule]
        n_batch = 50
        batch_length = 20
        n_burn = 400
        n_thin = 3
        seed = 99

        [chains]
        chains = 2

        [priors]
        beta_variance = 1.5
        phi_bounds = [1.0, 30.0]

        [spatial]
        neighbors = 8
        covariance_model = 'spherical'
        ",
    )
    .expect("valid configuration");
    assert_eq!(config.schedule.retained_draws(), 200);
    assert_eq!(config.chains.chains, 2);
    assert_eq!(config.priors.phi_bounds, Some((1.0, 30.0)));
    assert_eq!(config.spatial.map(|spatial| spatial.neighbors), Some(8));
    assert_eq!(config.n_factors, 2);

    assert!(SamplerConfig::from_toml_str("[schedule]\nn_thin = 0\n").is_err());
    assert!(SamplerConfig::from_toml_str("schedule = 3").is_err());
}
