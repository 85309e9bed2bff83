use super::*;
use crate::activations::ActivationBatch;
use crate::config::{FinetuningTrainConfig, MahalanobisTrainConfig, SpectralTrainConfig};
use crate::data::Dataset;
use crate::nn::{normal, Mlp};

fn model() -> Mlp {
    Mlp::new(&[4, 5, 3], Some(11)).expect("valid sizes")
}

fn layers() -> Vec<String> {
    vec!["layer0".to_string(), "logits".to_string()]
}

fn inputs(n: usize, seed: u64) -> Matrix<f32> {
    normal(n, 4, 0.0, 1.0, Some(seed))
}

fn labelled(n: usize, seed: u64) -> Dataset {
    let x = inputs(n, seed);
    let labels = x.rows().map(|row| usize::from(row[0] > 0.0) + usize::from(row[1] > 1.0)).collect();
    Dataset::new(x, labels).expect("one label per row")
}

fn synthetic_batch(n: usize, seed: u64) -> ActivationBatch {
    let mut batch = ActivationBatch::new();
    batch.insert("layer0".into(), normal(n, 5, 0.0, 1.0, Some(seed)));
    batch.insert("logits".into(), normal(n, 3, 2.0, 0.5, Some(seed + 100)));
    batch
}

fn mahalanobis(relative: bool) -> MahalanobisDetector<Mlp> {
    MahalanobisDetector::new(
        model(),
        layers(),
        MahalanobisTrainConfig {
            relative,
            ..Default::default()
        },
    )
    .expect("known layers")
}

fn spectral(source: DataSource) -> SpectralSignatureDetector<Mlp> {
    SpectralSignatureDetector::new(model(), layers(), SpectralTrainConfig::default(), source)
        .expect("known layers")
}

fn finetuning() -> FinetuningDetector<Mlp> {
    FinetuningDetector::new(
        model(),
        FinetuningTrainConfig {
            lr: 0.05,
            batch_size: 8,
            epochs: 2,
            ..Default::default()
        },
    )
    .expect("valid config")
}

// ========== Kinds and aggregation ==========

#[test]
fn test_detector_kind_names_roundtrip() {
    for kind in [
        DetectorKind::Mahalanobis,
        DetectorKind::SpectralSignature,
        DetectorKind::Finetuning,
    ] {
        assert_eq!(kind.to_string().parse::<DetectorKind>().expect("known"), kind);
    }
    assert!(matches!(
        "abstraction".parse::<DetectorKind>(),
        Err(WardenError::Format(_))
    ));
}

#[test]
fn test_aggregate_layer_scores_is_mean() {
    let mut scores = LayerScores::new();
    scores.insert("a".into(), vec![1.0, 2.0]);
    scores.insert("b".into(), vec![3.0, 6.0]);
    assert_eq!(aggregate_layer_scores(&scores).expect("consistent"), vec![2.0, 4.0]);

    scores.insert("c".into(), vec![1.0]);
    assert!(aggregate_layer_scores(&scores).is_err());
    assert!(aggregate_layer_scores(&LayerScores::new()).is_err());
}

// ========== Construction ==========

#[test]
fn test_constructor_validates_layers() {
    let config = MahalanobisTrainConfig::default();
    assert!(matches!(
        MahalanobisDetector::new(model(), vec![], config.clone()),
        Err(WardenError::Config(_))
    ));
    assert!(matches!(
        MahalanobisDetector::new(model(), vec!["layer7".into()], config.clone()),
        Err(WardenError::Config(_))
    ));
    assert!(matches!(
        MahalanobisDetector::new(model(), vec!["logits".into(), "logits".into()], config),
        Err(WardenError::Config(_))
    ));
}

#[test]
fn test_constructor_validates_config() {
    let bad = MahalanobisTrainConfig {
        rcond: 0.0,
        ..Default::default()
    };
    assert!(matches!(
        MahalanobisDetector::new(model(), layers(), bad),
        Err(WardenError::InvalidHyperparameter { .. })
    ));
}

// ========== Covariance detectors ==========

#[test]
fn test_untrained_detector_refuses_to_score_or_save() {
    let detector = mahalanobis(false);
    assert!(!detector.is_trained());
    assert!(matches!(
        detector.scores(&inputs(2, 0)),
        Err(WardenError::State(_))
    ));
    assert!(matches!(detector.to_file(), Err(WardenError::State(_))));
}

#[test]
fn test_mahalanobis_requires_trusted_data() {
    let data = Dataset::unlabeled(inputs(20, 1));
    let mut detector = mahalanobis(false);
    assert!(matches!(
        detector.train(None, Some(&data)),
        Err(WardenError::Config(_))
    ));
    detector.train(Some(&data), None).expect("trusted data supplied");
    assert!(detector.is_trained());
}

#[test]
fn test_spectral_requires_selected_source() {
    let data = Dataset::unlabeled(inputs(20, 1));

    let mut untrusted = spectral(DataSource::Untrusted);
    assert!(matches!(
        untrusted.train(Some(&data), None),
        Err(WardenError::Config(_))
    ));
    untrusted.train(None, Some(&data)).expect("untrusted supplied");

    let mut trusted = spectral(DataSource::Trusted);
    assert!(matches!(
        trusted.train(None, Some(&data)),
        Err(WardenError::Config(_))
    ));
    trusted.train(Some(&data), None).expect("trusted supplied");
}

#[test]
fn test_empty_dataset_is_rejected() {
    let empty = Dataset::unlabeled(Matrix::zeros(0, 4));
    assert!(matches!(
        mahalanobis(false).train(Some(&empty), None),
        Err(WardenError::EmptyInput(_))
    ));
}

#[test]
fn test_mean_sample_scores_zero_on_every_layer() {
    for relative in [false, true] {
        let mut detector = mahalanobis(relative);
        detector
            .fit_activations((0..4).map(|i| synthetic_batch(50, i)))
            .expect("fit");

        let mut at_mean = ActivationBatch::new();
        for (name, params) in detector.params().expect("trained") {
            let row: Vec<f32> = params.mean.iter().map(|&m| m as f32).collect();
            at_mean.insert(name.clone(), Matrix::from_vec(1, row.len(), row).expect("1 x d"));
        }
        let scores = detector.layerwise_scores_for(&at_mean).expect("trained");
        assert_eq!(scores.len(), 2);
        for (name, layer_scores) in &scores {
            assert!(layer_scores[0].abs() < 1e-6, "layer {name}: {}", layer_scores[0]);
        }
    }
}

#[test]
fn test_fit_activations_needs_watched_layers() {
    let mut detector = mahalanobis(false);
    let mut batch = synthetic_batch(10, 0);
    batch.remove("logits");
    assert!(matches!(
        detector.fit_activations([batch]),
        Err(WardenError::Config(_))
    ));
    assert!(matches!(
        detector.fit_activations(Vec::new()),
        Err(WardenError::EmptyInput(_))
    ));
}

#[test]
fn test_extra_layers_are_ignored() {
    let mut detector = MahalanobisDetector::new(
        model(),
        vec!["logits".into()],
        MahalanobisTrainConfig::default(),
    )
    .expect("known layer");
    detector.fit_activations([synthetic_batch(30, 3)]).expect("fit");
    assert_eq!(
        detector.params().expect("trained").keys().collect::<Vec<_>>(),
        vec!["logits"]
    );
}

#[test]
fn test_max_batches_caps_training_data() {
    let data = Dataset::unlabeled(inputs(100, 5));
    let prefix = Dataset::unlabeled(data.inputs().slice_rows(0, 20));

    let config = MahalanobisTrainConfig {
        max_batches: 2,
        batch_size: 10,
        ..Default::default()
    };
    let mut capped = MahalanobisDetector::new(model(), layers(), config).expect("valid");
    capped.train(Some(&data), None).expect("train");

    let config = MahalanobisTrainConfig {
        batch_size: 10,
        ..Default::default()
    };
    let mut reference = MahalanobisDetector::new(model(), layers(), config).expect("valid");
    reference.train(Some(&prefix), None).expect("train");

    assert_eq!(capped.params(), reference.params());
}

#[test]
fn test_chunked_extraction_matches_single_pass() {
    let data = Dataset::unlabeled(inputs(60, 12));
    let mut whole = mahalanobis(true);
    whole.train(Some(&data), None).expect("train");

    let mut chunked = mahalanobis(true).with_max_batch_size(7).expect("non-zero");
    assert_eq!(chunked.max_batch_size(), Some(7));
    chunked.train(Some(&data), None).expect("train");

    assert_eq!(chunked.params(), whole.params());
    let held_out = inputs(23, 13);
    assert_eq!(
        chunked.layerwise_scores(&held_out).expect("trained"),
        whole.layerwise_scores(&held_out).expect("trained")
    );
}

#[test]
fn test_zero_max_batch_size_is_rejected() {
    assert!(matches!(
        spectral(DataSource::Trusted).with_max_batch_size(0),
        Err(WardenError::InvalidHyperparameter { .. })
    ));
}

#[test]
fn test_spectral_vector_follows_dominant_axis() {
    let mut batch = ActivationBatch::new();
    let mut x = normal(400, 5, 0.0, 1.0, Some(8));
    for i in 0..x.n_rows() {
        let v = x.get(i, 2);
        x.set(i, 2, v * 10.0);
    }
    batch.insert("layer0".into(), x);

    let mut detector = SpectralSignatureDetector::new(
        model(),
        vec!["layer0".into()],
        SpectralTrainConfig::default(),
        DataSource::Untrusted,
    )
    .expect("known layer");
    detector.fit_activations([batch]).expect("fit");

    let v = &detector.params().expect("trained")["layer0"].top_singular_vector;
    assert!((v.norm() - 1.0).abs() < 1e-6);
    assert!(v[2].abs() > 0.99, "top vector {v}");
}

#[test]
fn test_mahalanobis_save_load_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mahalanobis.safetensors");
    let data = Dataset::unlabeled(inputs(60, 2));
    let held_out = inputs(7, 3);

    let mut trained = mahalanobis(true);
    trained.train(Some(&data), None).expect("train");
    trained.save(&path).expect("save");

    // The loaded detector takes relative mode from the file, not its config
    let mut loaded = mahalanobis(false);
    loaded.load(&path).expect("load");
    assert_eq!(loaded.params(), trained.params());
    assert_eq!(
        loaded.layerwise_scores(&held_out).expect("trained"),
        trained.layerwise_scores(&held_out).expect("trained")
    );

    let file = DetectorFile::load(&path).expect("load file");
    assert_eq!(file.flag("relative"), Some("true"));
    let config = file.config().expect("valid json").expect("present");
    assert_eq!(config.detector.kind(), DetectorKind::Mahalanobis);
}

#[test]
fn test_spectral_save_load_roundtrip() {
    let data = Dataset::unlabeled(inputs(60, 4));
    let mut trained = spectral(DataSource::Untrusted);
    trained.train(None, Some(&data)).expect("train");

    let bytes = trained.to_file().expect("trained").to_bytes().expect("serializable");
    let mut loaded = spectral(DataSource::Untrusted);
    loaded
        .load_file(&DetectorFile::from_bytes(&bytes).expect("valid"))
        .expect("load");

    let held_out = inputs(5, 9);
    assert_eq!(
        loaded.scores(&held_out).expect("trained"),
        trained.scores(&held_out).expect("trained")
    );
}

#[test]
fn test_load_rejects_missing_keys() {
    let mut file = DetectorFile::new(DetectorKind::Mahalanobis);
    file.insert_vector("means.layer0", &DVector::zeros(5));
    assert!(matches!(
        mahalanobis(false).load_file(&file),
        Err(WardenError::MissingKey(_))
    ));

    file.insert_matrix("inv_covariances.layer0", &DMatrix::identity(5, 5));
    file.set_flag("relative", "true").expect("not reserved");
    assert!(matches!(
        mahalanobis(false).load_file(&file),
        Err(WardenError::MissingKey(_))
    ));

    let empty = DetectorFile::new(DetectorKind::SpectralSignature);
    assert!(matches!(
        spectral(DataSource::Trusted).load_file(&empty),
        Err(WardenError::MissingKey(_))
    ));
}

#[test]
fn test_load_rejects_wrong_shapes() {
    let mut file = DetectorFile::new(DetectorKind::Mahalanobis);
    file.insert_vector("means.layer0", &DVector::zeros(5));
    file.insert_matrix("inv_covariances.layer0", &DMatrix::identity(4, 4));
    assert!(matches!(
        mahalanobis(false).load_file(&file),
        Err(WardenError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_load_rejects_layers_unknown_to_model() {
    let mut file = DetectorFile::new(DetectorKind::SpectralSignature);
    file.insert_vector("means.layer7", &DVector::zeros(5));
    file.insert_vector("top_singular_vectors.layer7", &DVector::from_element(5, 0.2));
    file.set_flag("data_source", "trusted").expect("not reserved");

    let mut detector = spectral(DataSource::Trusted);
    assert!(matches!(detector.load_file(&file), Err(WardenError::Config(_))));
    assert!(!detector.is_trained());
    assert_eq!(detector.layers(), layers().as_slice());
}

#[test]
fn test_load_rejects_other_kind() {
    let data = Dataset::unlabeled(inputs(30, 6));
    let mut spectral = spectral(DataSource::Trusted);
    spectral.train(Some(&data), None).expect("train");
    let file = spectral.to_file().expect("trained");
    assert!(matches!(
        mahalanobis(false).load_file(&file),
        Err(WardenError::Format(_))
    ));
}

// ========== Finetuning ==========

#[test]
fn test_finetuning_untrained_scores_are_state_error() {
    let detector = finetuning();
    assert!(!detector.is_trained());
    assert!(matches!(
        detector.scores(&inputs(2, 0)),
        Err(WardenError::State(_))
    ));
}

#[test]
fn test_finetuning_identity_scores_are_zero() {
    let mut detector = finetuning();
    let snapshot = detector.to_file().expect("snapshot");
    detector.load_file(&snapshot).expect("same architecture");
    assert!(detector.is_trained());
    assert_eq!(detector.finetuned_model(), detector.model());

    let scores = detector.scores(&inputs(10, 0)).expect("finite");
    assert_eq!(scores, vec![0.0; 10]);
}

#[test]
fn test_finetuning_layerwise_is_unsupported() {
    let mut detector = finetuning();
    assert!(matches!(
        detector.layerwise_scores(&inputs(3, 0)),
        Err(WardenError::Unsupported(_))
    ));
    detector.train(Some(&labelled(32, 1)), None).expect("train");
    assert!(matches!(
        detector.layerwise_scores(&inputs(3, 0)),
        Err(WardenError::Unsupported(_))
    ));
}

#[test]
fn test_finetuning_requires_trusted_data() {
    let mut detector = finetuning();
    assert!(matches!(
        detector.train(None, Some(&labelled(8, 0))),
        Err(WardenError::Config(_))
    ));
    assert!(matches!(
        detector.train(Some(&Dataset::unlabeled(inputs(8, 0))), None),
        Err(WardenError::Config(_))
    ));
}

#[test]
fn test_finetuning_moves_only_the_copy() {
    let mut detector = finetuning();
    let original = detector.model().clone();
    let report = detector.train(Some(&labelled(64, 2)), None).expect("train");
    assert_eq!(report.steps, 16);

    assert_eq!(detector.model(), &original);
    assert_ne!(detector.finetuned_model(), &original);
    let scores = detector.scores(&inputs(20, 3)).expect("finite");
    assert!(scores.iter().all(|&s| s >= 0.0));
    assert!(scores.iter().any(|&s| s > 0.0));
}

#[test]
fn test_finetuning_debug_mode_takes_two_steps() {
    let mut detector = FinetuningDetector::new(
        model(),
        FinetuningTrainConfig {
            debug: true,
            ..Default::default()
        },
    )
    .expect("valid config");
    let report = detector.train(Some(&labelled(64, 2)), None).expect("train");
    assert_eq!(report.steps, 2);
}

#[test]
fn test_finetuning_custom_optimizer_factory() {
    let mut detector = FinetuningDetector::new(
        model(),
        FinetuningTrainConfig {
            lr: 0.1,
            batch_size: 16,
            optimizer: crate::nn::optim::OptimizerFactory::sgd(0.9),
            ..Default::default()
        },
    )
    .expect("valid config");
    let report = detector.train(Some(&labelled(32, 4)), None).expect("train");
    assert_eq!(report.steps, 2);
    assert_ne!(detector.finetuned_model(), detector.model());
}

#[test]
fn test_finetuning_save_load_rehydrates_copy_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("finetuned.safetensors");

    let mut trained = finetuning();
    trained.train(Some(&labelled(48, 5)), None).expect("train");
    trained.save(&path).expect("save");

    let mut loaded = finetuning();
    assert!(!loaded.is_trained());
    loaded.load(&path).expect("load");
    assert!(loaded.is_trained());
    assert_eq!(loaded.finetuned_model(), trained.finetuned_model());
    assert_eq!(loaded.model(), trained.model());

    let held_out = inputs(6, 8);
    assert_eq!(
        loaded.scores(&held_out).expect("finite"),
        trained.scores(&held_out).expect("finite")
    );
}

#[test]
fn test_finetuning_load_validates_against_model() {
    let trained = finetuning();
    let file = trained.to_file().expect("snapshot");

    let wider = Mlp::new(&[4, 7, 3], Some(0)).expect("valid sizes");
    let mut other = FinetuningDetector::new(wider, FinetuningTrainConfig::default())
        .expect("valid config");
    assert!(matches!(
        other.load_file(&file),
        Err(WardenError::DimensionMismatch { .. })
    ));

    let empty = DetectorFile::new(DetectorKind::Finetuning);
    assert!(matches!(
        finetuning().load_file(&empty),
        Err(WardenError::MissingKey(_))
    ));
}

#[test]
fn test_infinite_kl_is_an_error() {
    let mut detector = finetuning();
    let mut file = detector.to_file().expect("snapshot");
    file.insert_tensor("finetuned.layers.1.bias", vec![0.0, f32::NEG_INFINITY, 0.0], vec![3]);
    detector.load_file(&file).expect("shapes match");

    let err = detector.scores(&inputs(4, 1)).expect_err("q has zero mass");
    assert!(matches!(err, WardenError::NonFiniteScore { .. }));
    assert!(err.is_numerical());
}

#[test]
fn test_set_model_resets_copy() {
    let mut detector = finetuning();
    detector.train(Some(&labelled(32, 6)), None).expect("train");
    let fresh = Mlp::new(&[4, 5, 3], Some(99)).expect("valid sizes");
    detector.set_model(fresh.clone());
    assert!(!detector.is_trained());
    assert_eq!(detector.finetuned_model(), &fresh);
    assert!(matches!(
        detector.scores(&inputs(3, 0)),
        Err(WardenError::State(_))
    ));
}
