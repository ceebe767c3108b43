use std::collections::BTreeMap;

use swarm_privacy::{
    init_tracing, seeded_rng_factory, BudgetDimension, FederatedClient, ModelParameters, ModelUpdate, NoiseMechanism, PrivacyConfig, PrivacyError, PrivacyEvent,
    PrivacyJob, PrivacyManager, ValidationCheck,
};

fn update(client: &str, job: &str, round: u64, values: &[f64]) -> ModelUpdate {
    let mut weights = BTreeMap::new();
    weights.insert("conv1".to_string(), values.to_vec());
    let mut biases = BTreeMap::new();
    biases.insert("conv1".to_string(), vec![0.01]);
    ModelUpdate::new(client, job, round, ModelParameters::new(weights, biases))
}

fn clients(ids: &[&str]) -> Vec<FederatedClient> { ids.iter().map(|id| FederatedClient::new(*id, None)).collect() }

fn ids(ids: &[&str]) -> Vec<String> { ids.iter().map(|s| s.to_string()).collect() }

fn manager_with(f: impl FnOnce(&mut PrivacyConfig)) -> PrivacyManager {
    let _ = init_tracing("privacy-pipeline-test");
    let mut cfg = PrivacyConfig::default();
    f(&mut cfg);
    PrivacyManager::new(cfg).unwrap().with_rng_factory(seeded_rng_factory(42))
}

#[test]
fn third_update_exceeds_job_budget() {
    let mgr = manager_with(|c| c.differential_privacy.epsilon = 3.0);
    let event = mgr.initialize_privacy_budget(&PrivacyJob::new("job-1", 8.0, 1e-5), &clients(&["c1"])).unwrap();
    assert!(matches!(event, PrivacyEvent::BudgetInitialized { clients: 1, .. }));

    let first = mgr.apply_privacy_protection(&update("c1", "job-1", 1, &[0.2, 0.4])).unwrap();
    let second = mgr.apply_privacy_protection(&update("c1", "job-1", 2, &[0.2, 0.4])).unwrap();
    assert_eq!(first.privacy_proof.privacy_accountant_state.used_epsilon, 3.0);
    assert_eq!(second.privacy_proof.privacy_accountant_state.used_epsilon, 6.0);

    mgr.validate_update(&first).unwrap();
    mgr.validate_update(&second).unwrap();

    match mgr.apply_privacy_protection(&update("c1", "job-1", 3, &[0.2, 0.4])) {
        Err(PrivacyError::BudgetExceeded { dimension, required, available, .. }) => {
            assert_eq!(dimension, BudgetDimension::Epsilon);
            assert_eq!(required, 3.0);
            assert!((available - 2.0).abs() < 1e-9);
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }
    assert_eq!(mgr.client_budget("job-1", "c1").unwrap().used_epsilon, 6.0);
}

#[test]
fn update_spending_the_last_budget_still_validates() {
    let mgr = manager_with(|c| c.differential_privacy.epsilon = 4.0);
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-x", 8.0, 1e-5), &clients(&["c1"])).unwrap();
    let first = mgr.apply_privacy_protection(&update("c1", "job-x", 1, &[0.2, 0.4])).unwrap();
    let last = mgr.apply_privacy_protection(&update("c1", "job-x", 2, &[0.2, 0.4])).unwrap();
    assert_eq!(mgr.remaining_budget("job-x", "c1").unwrap().0, 0.0);

    mgr.validate_update(&last).unwrap();
    mgr.validate_update(&first).unwrap();
    let err = mgr.apply_privacy_protection(&update("c1", "job-x", 3, &[0.2, 0.4])).unwrap_err();
    assert!(matches!(err, PrivacyError::BudgetExceeded { available, .. } if available == 0.0));
}

#[test]
fn default_delta_supports_many_rounds() {
    let mgr = manager_with(|_| {});
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-r", 100.0, 1e-5), &clients(&["c1"])).unwrap();
    for round in 0..60 {
        let protected = mgr.apply_privacy_protection(&update("c1", "job-r", round, &[0.1, -0.1])).unwrap();
        mgr.validate_update(&protected).unwrap();
    }
    let budget = mgr.client_budget("job-r", "c1").unwrap();
    assert_eq!(budget.used_epsilon, 60.0);
    assert!(budget.used_delta < 1e-5);
}

#[test]
fn spent_budget_is_monotone_and_bounded() {
    let mgr = manager_with(|c| c.differential_privacy.epsilon = 0.3);
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-m", 2.0, 1e-5), &[FederatedClient::new("c1", Some(1.0))]).unwrap();
    let mut last = 0.0;
    for round in 0..6 {
        let before = mgr.client_budget("job-m", "c1").unwrap().used_epsilon;
        let result = mgr.apply_privacy_protection(&update("c1", "job-m", round, &[0.1, 0.1]));
        let after = mgr.client_budget("job-m", "c1").unwrap().used_epsilon;
        assert!(after >= before);
        assert!(after <= 1.0 + 1e-9);
        match result {
            Ok(protected) => { assert!(protected.privacy_proof.privacy_accountant_state.used_epsilon > last); last = protected.privacy_proof.privacy_accountant_state.used_epsilon; }
            Err(e) => { assert!(e.is_budget_error()); assert_eq!(after, before); }
        }
    }
    assert!((last - 0.9).abs() < 1e-9);
}

#[test]
fn every_mechanism_yields_a_valid_proof() {
    for mechanism in [NoiseMechanism::Staircase, NoiseMechanism::Gaussian, NoiseMechanism::Laplace] {
        let mgr = manager_with(|c| c.differential_privacy.epsilon = 0.5);
        mgr.initialize_privacy_budget(&PrivacyJob::new("job-p", 8.0, 1e-5), &clients(&["c1"])).unwrap();
        let protected = mgr.apply_privacy_protection_with(&update("c1", "job-p", 1, &[0.3, -0.3]), mechanism).unwrap();
        assert_eq!(protected.privacy_proof.mechanism_applied, mechanism.as_str());
        assert_eq!(protected.privacy_proof.epsilon_used, 0.5);
        assert!(protected.verify_integrity());
        mgr.validate_update(&protected).unwrap();
        let expected_delta = if mechanism.uses_delta() { 1e-7 } else { 0.0 };
        assert_eq!(mgr.client_budget("job-p", "c1").unwrap().used_delta, expected_delta);
    }
}

#[test]
fn secure_aggregation_enforces_threshold() {
    let mgr = manager_with(|_| {});
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-s", 8.0, 1e-5), &clients(&["a", "b", "c"])).unwrap();
    let session = mgr.setup_secure_aggregation_with_threshold("job-s", &ids(&["a", "b", "c"]), 2).unwrap();
    assert!(session.session_id.starts_with("job-s-"));

    let a = update("a", "job-s", 1, &[1.0, 2.0]);
    let b = update("b", "job-s", 1, &[3.0, 4.0]);
    assert!(matches!(mgr.perform_secure_aggregation(&session.session_id, std::slice::from_ref(&a)), Err(PrivacyError::InsufficientContributions { required: 2, received: 1 })));

    let outsider = update("z", "job-s", 1, &[0.0, 0.0]);
    assert!(matches!(mgr.perform_secure_aggregation(&session.session_id, &[a.clone(), outsider]), Err(PrivacyError::UnknownParticipant { .. })));

    let result = mgr.perform_secure_aggregation(&session.session_id, &[a.clone(), b]).unwrap();
    assert_eq!(result.contributions, 2);
    assert_eq!(result.parameters.weights["conv1"], vec![2.0, 3.0]);
    assert!(matches!(result.event(), PrivacyEvent::AggregationCompleted { encrypted: false, .. }));

    assert!(matches!(mgr.perform_secure_aggregation(&session.session_id, &[a]), Err(PrivacyError::SessionClosed(_))));
}

#[test]
fn default_threshold_is_capped_by_participants() {
    let mgr = manager_with(|c| c.secure_aggregation.threshold = 5);
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-t", 8.0, 1e-5), &clients(&["a", "b"])).unwrap();
    let session = mgr.setup_secure_aggregation("job-t", &ids(&["a", "b"])).unwrap();
    assert_eq!(session.threshold, 2);
    assert!(matches!(mgr.setup_secure_aggregation_with_threshold("job-t", &ids(&["a", "b"]), 3), Err(PrivacyError::InvalidThreshold { threshold: 3, participants: 2 })));
}

#[test]
fn encrypted_contributions_aggregate_to_the_mean() {
    let mgr = manager_with(|c| { c.homomorphic_encryption.enabled = true; c.secure_aggregation.threshold = 3; });
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-he", 8.0, 1e-5), &clients(&["a", "b", "c"])).unwrap();
    let session = mgr.setup_secure_aggregation("job-he", &ids(&["a", "b", "c"])).unwrap();

    let mut plaintexts = Vec::new();
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        let protected = mgr.apply_privacy_protection(&update(id, "job-he", 1, &[i as f64, 1.0])).unwrap();
        assert!(protected.parameters.is_encrypted());
        plaintexts.push(mgr.decrypt_parameters(&protected.parameters).unwrap().flatten());
        mgr.submit_contribution(&session.session_id, protected).unwrap();
    }
    let result = mgr.perform_collected_aggregation(&session.session_id).unwrap();
    assert_eq!(result.contributions, 3);
    assert!(result.parameters.is_encrypted());

    let decrypted = mgr.decrypt_parameters(&result.parameters).unwrap().flatten();
    for (k, value) in decrypted.iter().enumerate() {
        let mean = plaintexts.iter().map(|p| p[k]).sum::<f64>() / 3.0;
        assert!((value - mean).abs() < 1e-9, "coordinate {k}: {value} vs {mean}");
    }
}

#[test]
fn cleanup_is_idempotent_and_closes_the_job() {
    let mgr = manager_with(|c| c.homomorphic_encryption.enabled = true);
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-c", 8.0, 1e-5), &clients(&["a", "b"])).unwrap();
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-d", 8.0, 1e-5), &clients(&["b"])).unwrap();
    let session = mgr.setup_secure_aggregation("job-c", &ids(&["a", "b"])).unwrap();
    let protected = mgr.apply_privacy_protection(&update("a", "job-c", 1, &[0.1, 0.2])).unwrap();
    assert_eq!(mgr.get_privacy_metrics().encryption_contexts, 2);

    let events = mgr.cleanup_privacy_budget("job-c").unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], PrivacyEvent::SessionAborted { session_id, .. } if *session_id == session.session_id));
    match &events[1] {
        PrivacyEvent::BudgetFinalized { summary } => { assert_eq!(summary.consumption_count, 1); assert_eq!(summary.used_epsilon(), 1.0); }
        other => panic!("unexpected {other:?}"),
    }
    // "b" is still enrolled in job-d
    assert_eq!(mgr.get_privacy_metrics().encryption_contexts, 1);

    assert!(mgr.cleanup_privacy_budget("job-c").unwrap().is_empty());
    assert!(mgr.cleanup_privacy_budget("never-started").unwrap().is_empty());

    assert!(matches!(mgr.apply_privacy_protection(&update("a", "job-c", 2, &[0.1, 0.2])), Err(PrivacyError::JobClosed(_))));
    assert!(matches!(mgr.setup_secure_aggregation("job-c", &ids(&["a"])), Err(PrivacyError::JobClosed(_))));
    assert!(matches!(mgr.submit_contribution(&session.session_id, update("b", "job-c", 1, &[0.0, 0.0])), Err(PrivacyError::SessionClosed(_))));
    assert!(matches!(mgr.perform_secure_aggregation(&session.session_id, &[protected.clone()]), Err(PrivacyError::SessionClosed(_))));
    assert_eq!(mgr.coordinator().tracked_session_count(), 0);
    assert_eq!(mgr.accountant().tracked_job_count(), 1);
    let failure = mgr.validate_update(&protected).unwrap_err();
    assert_eq!(failure.check, ValidationCheck::Budget);
    assert!(matches!(failure.error, PrivacyError::JobClosed(_)));
}

#[test]
fn session_lifecycle_is_observable() {
    let mgr = manager_with(|_| {});
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-l", 8.0, 1e-5), &clients(&["a", "b"])).unwrap();
    let session = mgr.setup_secure_aggregation("job-l", &ids(&["a", "b"])).unwrap();
    assert_eq!(mgr.get_privacy_metrics().active_sessions, 1);
    assert_eq!(mgr.submit_contribution(&session.session_id, update("a", "job-l", 1, &[1.0, 1.0])).unwrap(), 1);
    assert!(matches!(mgr.submit_contribution(&session.session_id, update("a", "job-l", 1, &[1.0, 1.0])), Err(PrivacyError::DuplicateContribution { .. })));
    assert!(matches!(mgr.perform_collected_aggregation(&session.session_id), Err(PrivacyError::InsufficientContributions { .. })));
    mgr.cleanup_privacy_budget("job-l").unwrap();
    assert_eq!(mgr.get_privacy_metrics().active_sessions, 0);
    assert!(matches!(mgr.perform_collected_aggregation("missing"), Err(PrivacyError::UnknownSession(_))));
}

#[test]
fn yaml_config_drives_the_manager() {
    let cfg = PrivacyConfig::from_yaml_str("differential_privacy:\n  epsilon: 0.5\n  delta: 0.000001\n  mechanism: laplace\nsecure_aggregation:\n  threshold: 2\n").unwrap();
    assert_eq!(cfg.differential_privacy.mechanism, NoiseMechanism::Laplace);
    let mgr = PrivacyManager::new(cfg).unwrap().with_rng_factory(seeded_rng_factory(1));
    mgr.initialize_privacy_budget(&PrivacyJob::new("job-y", 1.0, 1e-5), &clients(&["a"])).unwrap();
    let protected = mgr.apply_privacy_protection(&update("a", "job-y", 1, &[0.5, 0.5])).unwrap();
    assert_eq!(protected.privacy_proof.mechanism_applied, "laplace");
    assert_eq!(protected.privacy_proof.delta_used, 0.0);
    assert_eq!(mgr.remaining_budget("job-y", "a").unwrap().0, 0.5);
    assert_eq!(mgr.get_privacy_metrics().mechanism, NoiseMechanism::Laplace);
}

#[test]
fn events_serialize_with_type_tag() {
    let event = PrivacyEvent::SessionAborted { job_id: "j".into(), session_id: "j-1".into() };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "session_aborted");
    assert_eq!(event.job_id(), "j");
}
