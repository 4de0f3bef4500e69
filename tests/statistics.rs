use proptest::prelude::*;

use value_echo::ingest::{assess_participant, DropReason};
use value_echo::stats::fdr::FDR_ALPHA;
use value_echo::stats::{benjamini_hochberg, icc_2_1};
use value_echo::CleaningConfig;

fn cleaning() -> CleaningConfig {
    CleaningConfig {
        completeness_threshold: 0.8,
        sd_floor: 4.0,
        mad_floor: 3.0,
        ..CleaningConfig::default()
    }
}

#[test]
fn completeness_at_threshold_is_kept() {
    let mut values: Vec<f64> = (0..10).map(|i| (i * 10) as f64).collect();
    values[8] = f64::NAN;
    values[9] = f64::NAN;
    let q = assess_participant("R1", &values, &values, 10, &cleaning());
    assert!((q.completeness - 0.8).abs() < 1e-12);
    assert!(q.kept(), "{:?}", q.reasons);

    values[7] = f64::NAN;
    let q = assess_participant("R1", &values, &values, 10, &cleaning());
    assert_eq!(q.reasons, vec![DropReason::Incomplete]);
}

#[test]
fn flatliner_needs_both_floors_breached() {
    let flat = vec![50.0; 20];
    let q = assess_participant("R1", &flat, &flat, 20, &cleaning());
    assert_eq!(q.reasons, vec![DropReason::Flatliner]);

    // SD 3 is under its floor, MAD 3 is not.
    let mut split = vec![47.0; 10];
    split.extend(vec![53.0; 10]);
    let q = assess_participant("R2", &split, &split, 20, &cleaning());
    assert!(q.sd < 4.0);
    assert!((q.mad - 3.0).abs() < 1e-12);
    assert!(q.kept(), "{:?}", q.reasons);

    let varied: Vec<f64> = (0..20).map(|i| (i * 5) as f64).collect();
    let q = assess_participant("R3", &varied, &varied, 20, &cleaning());
    assert!(q.kept());
}

#[test]
fn incomplete_and_flat_collects_both_reasons() {
    let mut values = vec![50.0; 10];
    values.extend(vec![f64::NAN; 10]);
    let q = assess_participant("R1", &values, &values, 20, &cleaning());
    assert_eq!(q.reasons, vec![DropReason::Incomplete, DropReason::Flatliner]);
    assert_eq!(q.answered, 10);
}

#[test]
fn icc_of_identical_ratings_is_one() {
    let x = [10.0, 35.0, 50.0, 72.5, 90.0];
    assert!((icc_2_1(&x, &x) - 1.0).abs() < 1e-12);
}

#[test]
fn icc_needs_three_complete_pairs() {
    assert!(icc_2_1(&[1.0, 2.0], &[1.0, 2.0]).is_nan());
    assert!(icc_2_1(&[1.0, 2.0, f64::NAN], &[1.0, 2.0, 3.0]).is_nan());
    assert!(icc_2_1(&[1.0, 2.0, 4.0], &[1.5, 2.0, 3.5]).is_finite());
}

#[test]
fn icc_penalises_systematic_offset() {
    let x = [10.0, 30.0, 50.0, 70.0, 90.0];
    let shifted: Vec<f64> = x.iter().map(|v| v + 15.0).collect();
    let icc = icc_2_1(&x, &shifted);
    assert!(icc < 1.0 && icc > 0.5, "{icc}");
}

#[test]
fn bh_family_smaller_than_inputs_is_rejected() {
    assert!(benjamini_hochberg(&[0.01, 0.02, 0.03], 2).is_err());
}

#[test]
fn bh_missing_p_values_are_not_ranked() {
    let res = benjamini_hochberg(&[0.01, f64::NAN, 0.02], 5).unwrap();
    assert!(res.q[1].is_nan());
    assert!(!res.rejected[1]);
    assert!((res.q[0] - 0.05).abs() < 1e-12);
    assert!((res.q[2] - 0.05).abs() < 1e-12);
}

proptest! {
    #[test]
    fn bh_q_values_are_bounded_and_monotone(
        p in prop::collection::vec(0.0f64..=1.0, 1..12),
        extra in 0usize..5,
    ) {
        let m = p.len() + extra;
        let res = benjamini_hochberg(&p, m).unwrap();

        let mut order: Vec<usize> = (0..p.len()).collect();
        order.sort_by(|&a, &b| p[a].partial_cmp(&p[b]).unwrap());
        for w in order.windows(2) {
            prop_assert!(res.q[w[0]] <= res.q[w[1]] + 1e-12);
        }
        for i in 0..p.len() {
            prop_assert!(res.q[i] >= p[i] - 1e-12);
            prop_assert!(res.q[i] <= 1.0);
            if res.rejected[i] {
                prop_assert!(p[i] <= FDR_ALPHA);
            }
        }
    }

    #[test]
    fn icc_is_one_for_any_repeated_varying_ratings(
        x in prop::collection::vec(0.0f64..100.0, 3..30),
    ) {
        let spread = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - x.iter().cloned().fold(f64::INFINITY, f64::min);
        prop_assume!(spread > 1e-3);
        prop_assert!((icc_2_1(&x, &x) - 1.0).abs() < 1e-9);
    }
}
