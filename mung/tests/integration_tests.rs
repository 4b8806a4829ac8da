use mung::anchors::*;
use mung::common::Mat;
use mung::dataset::Dataset;
use mung::embedding::{BasisId, Embedding};
use mung::integration::*;
use mung::neighbors::*;
use mung::pipeline::*;
use mung::projection::*;
use mung::{Interrupt, MungError};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const CENTRES: [[f32; 2]; 3] = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];

/// 2-D Gaussian blobs around `CENTRES`, shifted by `offset`
fn blobs(batch: &str, n: usize, offset: [f32; 2], seed: u64) -> (Embedding, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, 0.5).unwrap();
    let types: Vec<usize> = (0..n).map(|i| i % 3).collect();
    let coords = Mat::from_fn(n, 2, |i, j| CENTRES[types[i]][j] + offset[j] + noise.sample(&mut rng));
    let cells = (0..n).map(|i| format!("{}_{}", batch, i).into_boxed_str()).collect();
    (Embedding::new(batch, cells, coords, BasisId(11)).unwrap(), types)
}

fn type_centroid(emb: &Embedding, types: &[usize], t: usize) -> [f32; 2] {
    let rows: Vec<usize> = (0..types.len()).filter(|&i| types[i] == t).collect();
    let mut c = [0f32; 2];
    for &i in rows.iter() {
        c[0] += emb.coords()[(i, 0)];
        c[1] += emb.coords()[(i, 1)];
    }
    [c[0] / rows.len() as f32, c[1] / rows.len() as f32]
}

fn dist(x: [f32; 2], y: [f32; 2]) -> f32 {
    ((x[0] - y[0]).powi(2) + (x[1] - y[1]).powi(2)).sqrt()
}

#[test]
fn shifted_batch_is_corrected() {
    let (a, types_a) = blobs("a", 100, [0.0, 0.0], 1);
    let (b, types_b) = blobs("b", 100, [5.0, 5.0], 2);

    let config = IntegrationConfig::new(0.2, 2.0);
    let out = integrate_datasets(&[&a, &b], &config, &Interrupt::default()).unwrap();

    assert_eq!(out.report.merge_order, vec![0, 1]);
    assert_eq!(out.report.steps.len(), 1);
    assert!(out.report.steps[0].anchors > 0);
    assert_eq!(out.merged.num_cells(), 200);

    // the reference is untouched
    assert_eq!(out.per_dataset[0].coords(), a.coords());

    for t in 0..3 {
        let before = dist(type_centroid(&a, &types_a, t), type_centroid(&b, &types_b, t));
        let after = dist(
            type_centroid(&a, &types_a, t),
            type_centroid(&out.per_dataset[1], &types_b, t),
        );
        assert!(after < 0.1 * before, "type {}: {} -> {}", t, before, after);
    }
}

#[test]
fn larger_batch_becomes_reference() {
    let (a, _) = blobs("a", 60, [0.0, 0.0], 3);
    let (b, _) = blobs("b", 90, [1.0, 1.0], 4);
    let (c, _) = blobs("c", 60, [2.0, 0.0], 5);

    let config = IntegrationConfig::new(0.2, 2.0);
    let out = integrate_datasets(&[&a, &b, &c], &config, &Interrupt::default()).unwrap();

    assert_eq!(out.report.merge_order, vec![1, 0, 2]);
    assert_eq!(&*out.report.steps[0].query_batch, "a");
    assert_eq!(out.report.steps[1].reference_cells, 150);
    assert_eq!(out.per_dataset[1].coords(), b.coords());

    let stacked = out.corrected_in_input_order("all").unwrap();
    assert_eq!(stacked.num_cells(), 210);
    assert_eq!(&*stacked.cell_ids()[0], "a_0");
    assert_eq!(&*stacked.cell_ids()[60], "b_0");
}

#[test]
fn anchors_are_mutual_and_one_to_one() {
    let (a, _) = blobs("a", 90, [0.0, 0.0], 6);
    let (b, _) = blobs("b", 60, [0.5, -0.5], 7);

    let config = AnchorConfig::new(0.1);
    let set = find_anchors(&a, &b, &config, &Interrupt::default()).unwrap();

    assert!(!set.is_empty());
    assert!(set.len() <= 60);
    assert_eq!(set.batch_a(), "a");
    assert_eq!(set.batch_b(), "b");

    let knn = KnnConfig::exact(config.k_anchor);
    let ab = knn_between(&a, &b, &knn, &Interrupt::default()).unwrap();
    let ba = knn_between(&b, &a, &knn, &Interrupt::default()).unwrap();

    let mut used_a = std::collections::HashSet::new();
    let mut used_b = std::collections::HashSet::new();
    for x in set.anchors() {
        assert!(ab.indices[x.cell_a].contains(&x.cell_b));
        assert!(ba.indices[x.cell_b].contains(&x.cell_a));
        assert!(used_a.insert(x.cell_a));
        assert!(used_b.insert(x.cell_b));
        assert!(x.score >= 0.1 && x.score <= 1.0);
    }
}

#[test]
fn distant_clouds_have_no_anchors() {
    let (a, _) = blobs("a", 50, [0.0, 0.0], 8);
    let (b, _) = blobs("b", 50, [1000.0, 1000.0], 9);

    let mut config = IntegrationConfig::new(0.1, 2.0);
    config.align.centre = false;

    let err = integrate_datasets(&[&a, &b], &config, &Interrupt::default()).unwrap_err();
    match MungError::of(&err) {
        Some(MungError::NoAnchorsFound { batch_a, batch_b }) => {
            assert_eq!(batch_a, "integrated");
            assert_eq!(batch_b, "b");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn disjoint_clouds_have_no_anchors() {
    let (a, _) = blobs("a", 50, [0.0, 0.0], 12);
    let (b, _) = blobs("b", 50, [-500.0, 800.0], 13);
    let err = find_anchors(&a, &b, &AnchorConfig::new(0.05), &Interrupt::default()).unwrap_err();
    assert!(matches!(MungError::of(&err), Some(MungError::NoAnchorsFound { .. })));
}

#[test]
fn integration_can_be_cancelled() {
    let (a, _) = blobs("a", 50, [0.0, 0.0], 10);
    let (b, _) = blobs("b", 50, [1.0, 0.0], 11);
    let interrupt = Interrupt::new();
    interrupt.trigger();
    let err = integrate_datasets(&[&a, &b], &IntegrationConfig::new(0.1, 2.0), &interrupt).unwrap_err();
    assert_eq!(MungError::of(&err), Some(&MungError::Cancelled));
}

/// Cells × 10 features: type t is high on features 3t..3t+3; every
/// feature of the batch is shifted by `offset`
fn expression(batch: &str, n: usize, offset: f32, seed: u64) -> (Dataset, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, 0.5).unwrap();
    let types: Vec<usize> = (0..n).map(|i| (i * 7) % 3).collect();
    let data = Mat::from_fn(n, 10, |i, j| {
        let high = if j / 3 == types[i] { 10.0 } else { 0.0 };
        high + offset + noise.sample(&mut rng)
    });
    (Dataset::from_matrix(batch, data).unwrap(), types)
}

#[test]
fn integrate_then_cluster_recovers_types() {
    let (a, types_a) = expression("a", 120, 0.0, 21);
    let (b, types_b) = expression("b", 90, 4.0, 22);

    let mut config = PipelineConfig::new(5, 0.2, 2.0);
    config.target_clusters = Some(3);

    let out = integrate_and_cluster(&[&a, &b], &config, &Interrupt::default()).unwrap();
    let labels = &out.communities.result.labels;

    assert_eq!(out.communities.result.n_clusters, 3);
    assert_eq!(labels.len(), 210);
    assert_eq!(out.record.n_clusters, 3);
    assert_eq!(out.record.integration.merge_order, vec![0, 1]);

    let truth: Vec<usize> = types_a.iter().chain(types_b.iter()).copied().collect();
    for t in 0..3 {
        let members: std::collections::HashSet<usize> =
            (0..210).filter(|&i| truth[i] == t).map(|i| labels[i]).collect();
        assert_eq!(members.len(), 1, "type {} split over {:?}", t, members);
    }

    // both batches share every cluster
    for k in 0..3 {
        assert!((0..120).any(|i| labels[i] == k));
        assert!((120..210).any(|i| labels[i] == k));
    }

    let json = serde_json::to_string(&out.record).unwrap();
    assert!(json.contains("merge_order"));
}

#[test]
fn labels_transfer_to_shifted_query() {
    let (reference, types_r) = expression("ref", 120, 0.0, 31);
    let names = ["alpha", "beta", "gamma"];
    let reference = reference
        .with_annotation(types_r.iter().map(|&t| names[t].into()).collect())
        .unwrap();
    let (query, types_q) = expression("query", 60, 3.0, 32);

    let config = AnnotationConfig::new(5, 0.2, 2.0);
    let out = annotate(&reference, &query, &config, &Interrupt::default()).unwrap();

    let correct = (0..60)
        .filter(|&i| &*out.transfer.labels[i] == names[types_q[i]])
        .count();
    assert!(correct >= 57, "{} of 60 correct", correct);
    assert_eq!(out.record.anchors, out.anchors.len());
    assert!(out.transfer.confidence.iter().all(|&c| (0.0..=1.0).contains(&c)));
}

#[test]
fn projection_is_idempotent() {
    let (a, _) = expression("a", 40, 0.0, 41);
    let (b, _) = expression("b", 30, 1.0, 42);
    let config = ProjectionConfig::with_rank(4);

    let (basis, embeddings) = project_datasets(&[&a, &b], &config).unwrap();
    let again = basis.project(&a).unwrap();
    assert_eq!(again.coords(), embeddings[0].coords());
    assert_eq!(again.basis(), embeddings[0].basis());

    let (basis2, _) = project_datasets(&[&a, &b], &config).unwrap();
    assert_eq!(basis.id, basis2.id);
}
