use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use careline::core::error::ServiceError;
use careline::core::hooks::HookRunner;
use careline::files::LocalFileStorage;
use careline::notifications::{LiveChannel, LiveHub, Notification, NotificationFanout, NotificationType};
use careline::security::access::{AccessGrant, AccessGrantStore, InMemoryAccessGrantStore};
use careline::security::audit::{verify_chain, AuditAction, AuditTrail, InMemoryAuditStore};
use careline::security::guard::AuthorizationGuard;
use careline::security::identity::{Actor, InMemoryActorDirectory, OperatorRole};
use careline::sessions::{
    CreateSessionRequest, InMemorySessionStore, LifecycleConfig, SessionLifecycle, SessionStatus, SessionUpdate,
};

struct Clinic {
    lifecycle: SessionLifecycle,
    store: Arc<InMemorySessionStore>,
    grants: Arc<InMemoryAccessGrantStore>,
    directory: Arc<InMemoryActorDirectory>,
    audit: Arc<InMemoryAuditStore>,
    live: Arc<LiveHub>,
    uploads: tempfile::TempDir,
    patient: Actor,
    /// SUPPORT operator with full access to `patient`.
    operator_a: Actor,
    /// SUPPORT operator with view-only access to `patient`.
    operator_b: Actor,
    admin: Actor,
}

impl Clinic {
    async fn new() -> Self {
        Self::with_config(LifecycleConfig::default()).await
    }

    async fn with_config(config: LifecycleConfig) -> Self {
        let store = Arc::new(InMemorySessionStore::new());
        let grants = Arc::new(InMemoryAccessGrantStore::new());
        let directory = Arc::new(InMemoryActorDirectory::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let live = Arc::new(LiveHub::new(16));
        let uploads = tempfile::tempdir().expect("tempdir");

        let fanout = NotificationFanout::new(Duration::from_secs(1)).with_channel(Arc::new(LiveChannel::new(live.clone())));
        let hooks = Arc::new(HookRunner::new(
            Arc::new(AuditTrail::new(audit.clone(), Duration::from_secs(1))),
            Arc::new(fanout),
            Arc::new(LocalFileStorage::new(uploads.path())),
            Duration::from_secs(1),
        ));
        let guard = Arc::new(AuthorizationGuard::new(grants.clone(), config.store_timeout));
        let lifecycle = SessionLifecycle::new(store.clone(), directory.clone(), guard, hooks, config);

        let patient = Actor::patient(Uuid::new_v4());
        let operator_a = Actor::operator(Uuid::new_v4(), OperatorRole::Support);
        let operator_b = Actor::operator(Uuid::new_v4(), OperatorRole::Support);
        let admin = Actor::operator(Uuid::new_v4(), OperatorRole::Admin);

        directory.add_patient(patient.id, "Ana").await;
        directory.add_operator(operator_a.id, OperatorRole::Support).await;
        directory.add_operator(operator_b.id, OperatorRole::Support).await;
        directory.add_operator(admin.id, OperatorRole::Admin).await;
        grants
            .upsert(AccessGrant::full(patient.id, operator_a.id, admin.id))
            .await
            .expect("grant a");
        grants
            .upsert(AccessGrant::view_only(patient.id, operator_b.id, admin.id))
            .await
            .expect("grant b");

        Self {
            lifecycle,
            store,
            grants,
            directory,
            audit,
            live,
            uploads,
            patient,
            operator_a,
            operator_b,
            admin,
        }
    }

    fn tomorrow() -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::days(1)
    }

    async fn schedule(&self) -> Uuid {
        let request = CreateSessionRequest {
            patient_id: self.patient.id,
            date: Some(Self::tomorrow()),
            ..Default::default()
        };
        let created = self
            .lifecycle
            .create_session(&self.operator_a, request)
            .await
            .expect("create");
        created[0].id
    }
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn test_consent_round_trip_completes_session() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    let requested = clinic.lifecycle.request_complete(&clinic.patient, id).await.expect("request");
    assert_eq!(requested.complete_requested_by, Some(clinic.patient.id));
    assert_eq!(requested.status, SessionStatus::Scheduled);

    let completed = clinic
        .lifecycle
        .accept_complete(&clinic.operator_a, id)
        .await
        .expect("accept");
    assert_eq!(completed.status, SessionStatus::Completed);
    assert_eq!(completed.complete_accepted_by, Some(clinic.operator_a.id));

    let again = clinic.lifecycle.accept_complete(&clinic.operator_a, id).await;
    assert!(matches!(again, Err(ServiceError::InvalidTransition { .. })));
    let again = clinic.lifecycle.accept_complete(&clinic.patient, id).await;
    assert!(matches!(again, Err(ServiceError::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_requester_cannot_accept_own_request() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    clinic.lifecycle.request_complete(&clinic.patient, id).await.expect("request");
    let err = clinic
        .lifecycle
        .accept_complete(&clinic.patient, id)
        .await
        .expect_err("self accept");
    match err {
        ServiceError::InvalidTransition { current, allowed, .. } => {
            assert_eq!(current, SessionStatus::Scheduled);
            assert!(allowed.contains(&SessionStatus::Completed));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    clinic.lifecycle.request_delete(&clinic.operator_a, id).await.expect("request delete");
    let err = clinic.lifecycle.accept_delete(&clinic.operator_a, id).await;
    assert!(matches!(err, Err(ServiceError::InvalidTransition { .. })));
    assert_eq!(clinic.store.session_count().await, 1);
}

#[tokio::test]
async fn test_completion_only_through_consent() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    let update = SessionUpdate {
        status: Some(SessionStatus::Completed),
        ..Default::default()
    };
    let err = clinic.lifecycle.update_session(&clinic.operator_a, id, update).await;
    assert!(matches!(err, Err(ServiceError::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_terminal_sessions_are_final() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    let cancel = SessionUpdate {
        status: Some(SessionStatus::Cancelled),
        ..Default::default()
    };
    let cancelled = clinic
        .lifecycle
        .update_session(&clinic.operator_a, id, cancel)
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    let back = SessionUpdate {
        status: Some(SessionStatus::Scheduled),
        ..Default::default()
    };
    let err = clinic.lifecycle.update_session(&clinic.operator_a, id, back).await;
    assert!(matches!(
        err,
        Err(ServiceError::InvalidTransition { current: SessionStatus::Cancelled, .. })
    ));

    let err = clinic.lifecycle.request_complete(&clinic.patient, id).await;
    assert!(matches!(err, Err(ServiceError::InvalidTransition { .. })));

    let reschedule = SessionUpdate {
        date: Some(Clinic::tomorrow() + ChronoDuration::days(3)),
        ..Default::default()
    };
    let err = clinic.lifecycle.update_session(&clinic.operator_a, id, reschedule).await;
    assert!(matches!(err, Err(ServiceError::InvalidTransition { .. })));

    let err = clinic.lifecycle.reassign_operator(&clinic.admin, id, clinic.operator_a.id).await;
    assert!(matches!(err, Err(ServiceError::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_default_deny_without_grant() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;
    let stranger = Actor::operator(Uuid::new_v4(), OperatorRole::Basic);
    clinic.directory.add_operator(stranger.id, OperatorRole::Basic).await;

    assert!(matches!(
        clinic.lifecycle.get_session(&stranger, id).await,
        Err(ServiceError::Unauthorized(_))
    ));
    assert!(matches!(
        clinic.lifecycle.request_delete(&stranger, id).await,
        Err(ServiceError::Unauthorized(_))
    ));

    let other_patient = Actor::patient(Uuid::new_v4());
    assert!(matches!(
        clinic.lifecycle.get_session(&other_patient, id).await,
        Err(ServiceError::Unauthorized(_))
    ));

    clinic.grants.remove(clinic.patient.id, clinic.operator_b.id).await.expect("revoke");
    assert!(matches!(
        clinic.lifecycle.get_session(&clinic.operator_b, id).await,
        Err(ServiceError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_admin_cannot_create_sessions() {
    let clinic = Clinic::new().await;
    let request = CreateSessionRequest {
        patient_id: clinic.patient.id,
        operator_id: Some(clinic.operator_a.id),
        date: Some(Clinic::tomorrow()),
        ..Default::default()
    };
    let err = clinic.lifecycle.create_session(&clinic.admin, request).await;
    assert!(matches!(err, Err(ServiceError::Unauthorized(_))));
    assert_eq!(clinic.store.session_count().await, 0);

    let id = clinic.schedule().await;
    assert!(clinic.lifecycle.get_session(&clinic.admin, id).await.is_ok());
}

#[tokio::test]
async fn test_view_only_operator_may_request_but_not_edit() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    let requested = clinic
        .lifecycle
        .request_delete(&clinic.operator_b, id)
        .await
        .expect("view grant may request");
    assert_eq!(requested.delete_requested_by, Some(clinic.operator_b.id));

    let err = clinic.lifecycle.reassign_operator(&clinic.operator_b, id, clinic.operator_a.id).await;
    assert!(matches!(err, Err(ServiceError::Unauthorized(_))));

    let request = CreateSessionRequest {
        patient_id: clinic.patient.id,
        date: Some(Clinic::tomorrow()),
        ..Default::default()
    };
    let err = clinic.lifecycle.create_session(&clinic.operator_b, request).await;
    assert!(matches!(err, Err(ServiceError::Unauthorized(_))));
}

#[tokio::test]
async fn test_package_creation_numbers_sessions() {
    let clinic = Clinic::new().await;
    let request = CreateSessionRequest {
        patient_id: clinic.patient.id,
        date: Some(Clinic::tomorrow()),
        count: Some(4),
        interval_days: Some(7),
        ..Default::default()
    };
    let created = clinic
        .lifecycle
        .create_session(&clinic.operator_a, request)
        .await
        .expect("package");

    assert_eq!(created.len(), 4);
    let package_id = created[0].package_id.expect("package id");
    for (i, session) in created.iter().enumerate() {
        assert_eq!(session.package_id, Some(package_id));
        assert_eq!(session.session_number, Some(i as i32 + 1));
        assert_eq!(session.total_sessions, Some(4));
    }
    assert_eq!((created[3].date - created[0].date).num_days(), 21);

    let entries = clinic.audit.all().await;
    let creates: Vec<_> = entries.iter().filter(|e| e.action == AuditAction::SessionCreate).collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].resource_id, package_id.to_string());
}

#[tokio::test]
async fn test_failed_batch_leaves_nothing_behind() {
    let clinic = Clinic::new().await;
    clinic.store.fail_next_insert_at(2).await;

    let dates = (1..=4).map(|d| Utc::now() + ChronoDuration::days(d)).collect();
    let request = CreateSessionRequest {
        patient_id: clinic.patient.id,
        dates: Some(dates),
        ..Default::default()
    };
    let err = clinic.lifecycle.create_session(&clinic.operator_a, request).await;
    assert!(matches!(err, Err(ServiceError::StoreUnavailable(_))));
    assert_eq!(clinic.store.session_count().await, 0);
    assert!(clinic.audit.is_empty().await);
}

#[tokio::test]
async fn test_batch_validation() {
    let clinic = Clinic::new().await;
    let cases = vec![
        CreateSessionRequest {
            patient_id: clinic.patient.id,
            date: Some(Utc::now() - ChronoDuration::days(1)),
            ..Default::default()
        },
        CreateSessionRequest {
            patient_id: clinic.patient.id,
            date: Some(Clinic::tomorrow()),
            count: Some(51),
            ..Default::default()
        },
        CreateSessionRequest {
            patient_id: clinic.patient.id,
            dates: Some(vec![Clinic::tomorrow()]),
            count: Some(2),
            ..Default::default()
        },
    ];
    for request in cases {
        let err = clinic.lifecycle.create_session(&clinic.operator_a, request).await;
        assert!(matches!(err, Err(ServiceError::Validation(_))), "{err:?}");
    }

    let unknown_patient = CreateSessionRequest {
        patient_id: Uuid::new_v4(),
        date: Some(Clinic::tomorrow()),
        ..Default::default()
    };
    let err = clinic.lifecycle.create_session(&clinic.admin, unknown_patient).await;
    assert!(matches!(err, Err(ServiceError::Unauthorized(_))));
}

#[tokio::test]
async fn test_concurrent_accepts_have_one_winner() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;
    clinic.lifecycle.request_complete(&clinic.patient, id).await.expect("request");

    let (first, second) = tokio::join!(
        clinic.lifecycle.accept_complete(&clinic.operator_a, id),
        clinic.lifecycle.accept_complete(&clinic.operator_b, id),
    );

    let results = [first, second];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in &results {
        if let Err(e) = result {
            assert!(
                matches!(e, ServiceError::InvalidTransition { .. } | ServiceError::ConflictDuringWrite(_)),
                "{e:?}"
            );
        }
    }

    let accepts = clinic
        .audit
        .all()
        .await
        .into_iter()
        .filter(|e| e.action == AuditAction::CompleteAccepted)
        .count();
    assert_eq!(accepts, 1);
}

#[tokio::test]
async fn test_racing_accepts_lose_at_the_conditional_write() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;
    clinic.lifecycle.request_complete(&clinic.patient, id).await.expect("request");

    clinic.store.set_latency(Some(Duration::from_millis(30))).await;
    let (first, second) = tokio::join!(
        clinic.lifecycle.accept_complete(&clinic.operator_a, id),
        clinic.lifecycle.accept_complete(&clinic.operator_b, id),
    );
    clinic.store.set_latency(None).await;

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).expect("one accept loses");
    assert!(matches!(loser, ServiceError::ConflictDuringWrite(_)), "{loser:?}");

    let stored = clinic.lifecycle.get_session(&clinic.patient, id).await.expect("session");
    assert_eq!(stored.session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_create_validates_notes() {
    let clinic = Clinic::new().await;
    for notes in ["   ".to_string(), "x".repeat(4001)] {
        let request = CreateSessionRequest {
            patient_id: clinic.patient.id,
            date: Some(Clinic::tomorrow()),
            notes: Some(notes),
            ..Default::default()
        };
        let err = clinic.lifecycle.create_session(&clinic.operator_a, request).await;
        assert!(matches!(err, Err(ServiceError::Validation(_))), "{err:?}");
    }
    assert_eq!(clinic.store.session_count().await, 0);

    let request = CreateSessionRequest {
        patient_id: clinic.patient.id,
        date: Some(Clinic::tomorrow()),
        notes: Some("Bring the X-ray results".into()),
        ..Default::default()
    };
    let created = clinic
        .lifecycle
        .create_session(&clinic.operator_a, request)
        .await
        .expect("create");
    assert_eq!(created[0].notes.as_deref(), Some("Bring the X-ray results"));
}

#[tokio::test]
async fn test_newer_request_replaces_pending_one() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    clinic.lifecycle.request_delete(&clinic.patient, id).await.expect("patient request");
    let replaced = clinic
        .lifecycle
        .request_delete(&clinic.operator_a, id)
        .await
        .expect("operator request");
    assert_eq!(replaced.delete_requested_by, Some(clinic.operator_a.id));

    let err = clinic.lifecycle.accept_delete(&clinic.operator_a, id).await;
    assert!(matches!(err, Err(ServiceError::InvalidTransition { .. })));

    clinic.lifecycle.accept_delete(&clinic.patient, id).await.expect("patient accepts");
    assert_eq!(clinic.store.session_count().await, 0);
}

#[tokio::test]
async fn test_store_timeout_surfaces_as_unavailable() {
    let config = LifecycleConfig {
        store_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let clinic = Clinic::with_config(config).await;
    let id = clinic.schedule().await;

    clinic.store.set_latency(Some(Duration::from_millis(300))).await;
    let err = clinic.lifecycle.get_session(&clinic.patient, id).await;
    assert!(matches!(err, Err(ServiceError::StoreUnavailable(_))));

    clinic.store.set_latency(None).await;
    assert!(clinic.lifecycle.get_session(&clinic.patient, id).await.is_ok());
}

#[tokio::test]
async fn test_accept_delete_cascades_and_removes_files() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    let key = format!("sessions/{id}/scan.pdf");
    let path = clinic.uploads.path().join(&key);
    tokio::fs::create_dir_all(path.parent().expect("parent")).await.expect("mkdir");
    tokio::fs::write(&path, b"%PDF").await.expect("write");

    clinic
        .lifecycle
        .attach_file(&clinic.patient, id, "scan.pdf", &key)
        .await
        .expect("attach");
    let question = clinic
        .lifecycle
        .add_question(&clinic.patient, id, "Can I exercise afterwards?")
        .await
        .expect("question");
    clinic
        .lifecycle
        .answer_question(&clinic.operator_a, question.id, "Light walking only.")
        .await
        .expect("answer");

    let mut patient_rx = clinic.live.subscribe(clinic.patient.id).await;
    clinic.lifecycle.request_delete(&clinic.patient, id).await.expect("request");
    clinic.lifecycle.accept_delete(&clinic.operator_a, id).await.expect("accept");

    assert!(matches!(
        clinic.lifecycle.get_session(&clinic.patient, id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        clinic.lifecycle.answer_question(&clinic.operator_a, question.id, "again").await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(!path.exists());

    let received = drain(&mut patient_rx);
    assert!(received
        .iter()
        .any(|n| n.notification_type == NotificationType::SessionDeleted));
}

#[tokio::test]
async fn test_notifications_skip_the_actor() {
    let clinic = Clinic::new().await;
    let mut patient_rx = clinic.live.subscribe(clinic.patient.id).await;
    let mut operator_rx = clinic.live.subscribe(clinic.operator_a.id).await;

    let id = clinic.schedule().await;
    let to_patient = drain(&mut patient_rx);
    assert_eq!(to_patient.len(), 1);
    assert_eq!(to_patient[0].notification_type, NotificationType::SessionCreated);
    assert!(drain(&mut operator_rx).is_empty());

    clinic.lifecycle.request_complete(&clinic.patient, id).await.expect("request");
    assert!(drain(&mut patient_rx).is_empty());
    let to_operator = drain(&mut operator_rx);
    assert_eq!(to_operator.len(), 1);
    assert_eq!(to_operator[0].notification_type, NotificationType::CompleteRequested);
}

#[tokio::test]
async fn test_reassign_requires_clinical_operator() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;

    let err = clinic.lifecycle.reassign_operator(&clinic.admin, id, clinic.admin.id).await;
    assert!(matches!(err, Err(ServiceError::Validation(_))));

    let err = clinic.lifecycle.reassign_operator(&clinic.admin, id, clinic.operator_b.id).await;
    assert!(matches!(err, Err(ServiceError::Unauthorized(_))));

    clinic
        .grants
        .upsert(AccessGrant::full(clinic.patient.id, clinic.operator_b.id, clinic.admin.id))
        .await
        .expect("upgrade grant");
    let reassigned = clinic
        .lifecycle
        .reassign_operator(&clinic.admin, id, clinic.operator_b.id)
        .await
        .expect("reassign");
    assert_eq!(reassigned.operator_id, clinic.operator_b.id);
}

#[tokio::test]
async fn test_audit_chain_is_intact() {
    let clinic = Clinic::new().await;
    let id = clinic.schedule().await;
    clinic.lifecycle.request_complete(&clinic.patient, id).await.expect("request");
    clinic.lifecycle.accept_complete(&clinic.operator_a, id).await.expect("accept");
    clinic
        .lifecycle
        .add_feedback(&clinic.patient, id, 5, Some("  great  ".into()))
        .await
        .expect("feedback");

    let entries = clinic.audit.all().await;
    let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::SessionCreate,
            AuditAction::CompleteRequested,
            AuditAction::CompleteAccepted,
            AuditAction::FeedbackCreate,
        ]
    );
    assert!(verify_chain(&entries));
    assert_eq!(entries[2].actor_id, clinic.operator_a.id);
}
