use spatial_occupancy::{
    BatchSchedule, CovarianceModel, CrossValidationOptions, NewSites, OccupancySamples,
    OccupancySimulation, SamplerConfig, SpatialConfig, SpatialTruth, cross_validate_occupancy,
    fit_occupancy, predict_occupancy, simulate_occupancy, waic,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = OccupancySimulation {
        n_sites: 120,
        spatial: Some(SpatialTruth {
            sigma_sq: 1.2,
            phi: 4.0,
            covariance_model: CovarianceModel::Exponential,
        }),
        ..OccupancySimulation::default()
    };
    let data = simulate_occupancy(&settings, 99)?;
    let train_sites: Vec<usize> = (0..100).collect();
    let test_sites: Vec<usize> = (100..120).collect();
    let train = data.input.subset_sites(&train_sites)?;
    let test = data.input.subset_sites(&test_sites)?;

    let config = SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 120,
            batch_length: 25,
            n_burn: 1_500,
            n_thin: 5,
            seed: 5,
        },
        spatial: Some(SpatialConfig {
            neighbors: 10,
            covariance_model: CovarianceModel::Exponential,
        }),
        ..SamplerConfig::default()
    };
    let (model, report, samples) = fit_occupancy(&train, &config)?;
    let summary = &report.pooled_summary;
    if let (Some(sigma_sq), Some(range)) = (summary.sigma_sq, summary.effective_range) {
        println!(
            "sigma_sq mean={:.3}; effective range mean={:.3}, 95% CrI [{:.3}, {:.3}]",
            sigma_sq.mean, range.mean, range.q025, range.q975
        );
    }
    for chain in &report.chains {
        println!(
            "chain {}: phi acceptance={:.2}, final proposal scale={:.3}",
            chain.chain, chain.phi_acceptance[0], chain.phi_proposal_scale[0]
        );
    }

    let pooled = OccupancySamples::pooled(&samples);
    println!("WAIC={:.2}", waic(&pooled, &train)?.waic);

    if let Some(coordinates) = test.coordinates.clone() {
        let new_sites = NewSites::new(test.occupancy_design.clone(), 1).with_coordinates(coordinates);
        let prediction = predict_occupancy(&model, &pooled, &new_sites, 17)?;
        for (site, psi) in prediction.psi_mean.iter().enumerate().take(5) {
            println!("held-out site {site}: mean psi={psi:.3}");
        }
    }

    let cv = cross_validate_occupancy(
        &data.input,
        &config,
        CrossValidationOptions {
            k_folds: 4,
            seed: 3,
        },
    )?;
    println!(
        "4-fold CV deviance: mean={:.2}, total={:.2}",
        cv.mean_deviance, cv.total_deviance
    );
    Ok(())
}
