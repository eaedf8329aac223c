use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use spatial_occupancy::input::covariates::{detection_design, occupancy_design};
use spatial_occupancy::{
    BatchSchedule, DetectionArray, DetectionCovariate, FitStatistic, OccupancyCovariate,
    OccupancyInput, OccupancySamples, PpcGrouping, SamplerConfig, fit_occupancy,
    in_sample_deviance, posterior_predictive_check, waic,
};

fn logistic(value: f64) -> f64 {
    1.0 / (1.0 + (-value).exp())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (n_sites, n_replicates) = (80, 4);
    let mut rng = StdRng::seed_from_u64(2_026);
    let forest: Vec<f64> = (0..n_sites).map(|_| rng.random::<f64>() * 2.0 - 1.0).collect();
    let wind: Vec<f64> = (0..n_sites * n_replicates)
        .map(|_| rng.random::<f64>() * 2.0 - 1.0)
        .collect();

    let occupied: Vec<bool> = forest
        .iter()
        .map(|forest| rng.random::<f64>() < logistic(1.2f64.mul_add(*forest, 0.2)))
        .collect();
    let detections = DetectionArray::from_fn(n_sites, 1, n_replicates, |site, _, replicate| {
        let p = logistic((-0.8f64).mul_add(wind[site * n_replicates + replicate], 0.4));
        Some(occupied[site] && rng.random::<f64>() < p)
    });

    let occupancy = occupancy_design(&detections, &[("forest", OccupancyCovariate::Site(forest))])?;
    let detection = detection_design(
        &detections,
        &[("wind", DetectionCovariate::Observation(wind))],
    )?;
    let input = OccupancyInput::new(detections, occupancy.matrix, detection.matrix);

    let config = SamplerConfig {
        schedule: BatchSchedule {
            n_batch: 100,
            batch_length: 25,
            n_burn: 1_000,
            n_thin: 3,
            seed: 7,
        },
        ..SamplerConfig::default()
    };
    let (_model, report, samples) = fit_occupancy(&input, &config)?;

    for (label, summary) in occupancy.labels.iter().zip(&report.pooled_summary.beta) {
        println!(
            "beta[{label}] mean={:.3}, 95% CrI [{:.3}, {:.3}]",
            summary.mean, summary.q025, summary.q975
        );
    }
    for (label, summary) in detection.labels.iter().zip(&report.pooled_summary.alpha) {
        println!(
            "alpha[{label}] mean={:.3}, 95% CrI [{:.3}, {:.3}]",
            summary.mean, summary.q025, summary.q975
        );
    }
    if let Some(convergence) = &report.convergence {
        println!("max split R-hat: {:?}", convergence.max_split_rhat);
    }

    let pooled = OccupancySamples::pooled(&samples);
    let criteria = waic(&pooled, &input)?;
    println!(
        "WAIC={:.2}, p_waic={:.2}, deviance={:.2}",
        criteria.waic,
        criteria.p_waic,
        in_sample_deviance(&pooled, &input)?
    );

    let check = posterior_predictive_check(
        &pooled,
        &input,
        FitStatistic::FreemanTukey,
        PpcGrouping::Site,
        11,
    )?;
    println!("Freeman-Tukey Bayesian p-value: {:.3}", check.bayesian_p_value);
    Ok(())
}
