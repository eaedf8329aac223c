use spatial_occupancy::{
    BatchSchedule, CommunitySamples, CommunitySimulation, FitStatistic, PpcGrouping,
    SamplerConfig, SpatialConfig, WaicSummary, community_posterior_predictive_check,
    community_waic, fit_community, simulate_community,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = CommunitySimulation {
        n_species: 8,
        n_sites: 60,
        ..CommunitySimulation::default()
    };
    let data = simulate_community(&settings, 404)?;

    let config = SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 80,
            batch_length: 25,
            n_burn: 1_000,
            n_thin: 4,
            seed: 12,
        },
        spatial: Some(SpatialConfig {
            neighbors: 8,
            ..SpatialConfig::default()
        }),
        n_factors: 2,
        ..SamplerConfig::default()
    };
    let (model, report, samples) = fit_community(&data.input, &config)?;
    println!(
        "{} species, {} sites, {} spatial factors",
        model.n_species, model.n_sites, model.n_factors
    );

    let summary = &report.pooled_summary;
    for (j, (mean, variance)) in summary.beta_mean.iter().zip(&summary.beta_variance).enumerate() {
        println!(
            "community beta[{j}]: mean={:.3} (true {:.3}), variance={:.3} (true {:.3})",
            mean.mean, settings.beta_mean[j], variance.mean, settings.beta_variance[j]
        );
    }
    for (species, row) in summary.loadings.iter().enumerate() {
        let means: Vec<String> = row.iter().map(|value| format!("{:.2}", value.mean)).collect();
        println!("species {species} loadings: [{}]", means.join(", "));
    }

    let pooled = CommunitySamples::pooled(&samples);
    let total = WaicSummary::combine(&community_waic(&pooled, &data.input)?);
    println!("community WAIC={:.2}", total.waic);

    let checks = community_posterior_predictive_check(
        &pooled,
        &data.input,
        FitStatistic::ChiSquared,
        PpcGrouping::Site,
        1,
    )?;
    for (species, check) in checks.iter().enumerate() {
        println!("species {species}: chi-squared p-value={:.3}", check.bayesian_p_value);
    }
    Ok(())
}
