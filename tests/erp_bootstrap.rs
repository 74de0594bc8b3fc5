//! Event responses from despiked region time courses

mod common;

use common::*;
use fmri_qc::erp::{
    average_epochs, baseline_correct, bootstrap_group_response, extract_epochs,
    roi_mean_series, sphere_coordinates, BaselineMode, ErpParams, EventWindow,
};
use fmri_qc::VolumeSeries;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Series with a unit response starting at each onset inside a sphere
fn evoked_series(onsets: &[usize], nt: usize, seed: u64) -> VolumeSeries {
    let dims = (6, 6, 6);
    let n_vox = 216;
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.05).unwrap();
    let roi: Vec<usize> = sphere_coordinates(dims, (3.0, 3.0, 3.0), 1.5)
        .into_iter()
        .map(|(i, j, k)| i + j * 6 + k * 36)
        .collect();

    let mut data = vec![0.0; n_vox * nt];
    for t in 0..nt {
        let evoked = onsets.iter().any(|&o| t >= o && t < o + 3);
        for v in 0..n_vox {
            let signal = if evoked && roi.contains(&v) { 1.0 } else { 0.0 };
            data[v + t * n_vox] = 100.0 + signal + noise.sample(&mut rng);
        }
    }
    VolumeSeries::new(data, dims, nt).unwrap()
}

#[test]
fn test_group_response_recovers_evoked_shape() {
    let onsets = [5, 20, 35, 50];
    let window = EventWindow { pre: 2, post: 8 };
    let coords = sphere_coordinates((6, 6, 6), (3.0, 3.0, 3.0), 1.5);

    let subjects: Vec<Vec<f64>> = (0..8)
        .map(|s| {
            let series = evoked_series(&onsets, 60, s);
            let roi = roi_mean_series(&series, &coords).unwrap();
            let epochs: Vec<Vec<f64>> = extract_epochs(&roi, &onsets, window)
                .iter()
                .map(|e| baseline_correct(e, window.pre, BaselineMode::Subtract))
                .collect();
            assert_eq!(epochs.len(), onsets.len());
            average_epochs(&epochs).unwrap()
        })
        .collect();

    let group = bootstrap_group_response(&subjects, &ErpParams::default()).unwrap();
    assert_eq!(group.n_subjects, 8);
    assert_eq!(group.mean.len(), window.len());

    // Baseline near zero, response near one for three samples
    for s in 0..window.pre {
        assert!(group.mean[s].abs() < 0.1);
    }
    for s in window.pre..window.pre + 3 {
        assert!((group.mean[s] - 1.0).abs() < 0.1, "sample {} = {}", s, group.mean[s]);
    }
    for s in 0..window.len() {
        assert!(group.lower[s] <= group.mean[s] && group.mean[s] <= group.upper[s]);
    }
}

#[test]
fn test_out_of_range_onsets_dropped() {
    let series = evoked_series(&[1, 30], 40, 0);
    let coords = sphere_coordinates((6, 6, 6), (3.0, 3.0, 3.0), 1.0);
    let roi = roi_mean_series(&series, &coords).unwrap();

    let epochs = extract_epochs(&roi, &[1, 30, 38], EventWindow { pre: 3, post: 5 });
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].len(), 8);
}
