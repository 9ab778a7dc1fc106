use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::now_millis;
use crate::errors::EscrowError;
use crate::lifecycle::{CampaignOutcome, LifecycleSettings, LifecycleWorker, DEFAULT_AUTOMATION_ACTOR};
use crate::models::{AuditAction, CommitmentStatus, EntryType, Page};
use crate::money::Money;
use crate::repository;
use crate::state_machine::CampaignState;
use crate::test_utils::*;

const LEASE_TIMEOUT_MS: i64 = 300_000;

fn worker(pool: &sqlx::SqlitePool) -> LifecycleWorker {
    LifecycleWorker::new(pool.clone(), LifecycleSettings::default())
}

/// Campaign whose deadline has already passed, with `commits` of `units` each.
async fn due_campaign(
    service: &crate::service::EscrowService,
    min_threshold_units: Option<i64>,
    commits: usize,
    units: i64,
) -> String {
    let campaign = create_campaign(service, 100, min_threshold_units, now_millis() - 1_000).await;
    for i in 0..commits {
        commit_units(service, &campaign.id, &format!("p{i}@example.com"), units).await;
    }
    campaign.id
}

#[tokio::test]
async fn test_underfunded_campaign_fails_and_refunds_everyone() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 6, 10).await;

    let report = worker(&pool).run_cycle_at(now_millis()).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.refunds_issued, 6);
    assert_eq!(report.alerts_raised, 0);

    let campaign = service.campaign(&campaign_id).await.unwrap();
    assert_eq!(campaign.state, CampaignState::Failed);
    assert!(campaign.processing_lock.is_none());
    assert_eq!(count_entries(&pool, &campaign_id, EntryType::Refund).await, 6);
    for commitment in service.commitments(&campaign_id).await.unwrap() {
        assert_eq!(commitment.status, CommitmentStatus::Refunded);
    }
    assert_eq!(service.escrow_summary(&campaign_id).await.unwrap().balance, Money::ZERO);

    let logs = service.audit_page(Some(&campaign_id), Page::default()).await.unwrap();
    assert_eq!(logs[0].action, AuditAction::AutoRefunds);
    let transition = logs
        .iter()
        .find(|log| log.action == AuditAction::StateTransition)
        .unwrap();
    assert_eq!(transition.actor, DEFAULT_AUTOMATION_ACTOR);
    assert_eq!(transition.new_state, Some(CampaignState::Failed));
}

#[tokio::test]
async fn test_funded_campaign_moves_to_successor() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, Some(50), 6, 10).await;

    let report = worker(&pool).run_cycle_at(now_millis()).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.refunds_issued, 0);

    let campaign = service.campaign(&campaign_id).await.unwrap();
    assert_eq!(campaign.state, CampaignState::Procurement);
    assert!(campaign.processing_lock.is_none());
    assert_eq!(count_entries(&pool, &campaign_id, EntryType::Refund).await, 0);

    let logs = service.audit_page(Some(&campaign_id), Page::default()).await.unwrap();
    let steps: Vec<_> = logs
        .iter()
        .filter(|log| log.action == AuditAction::StateTransition)
        .map(|log| (log.previous_state, log.new_state, log.actor.as_str()))
        .collect();
    assert_eq!(
        steps,
        vec![
            (Some(CampaignState::Success), Some(CampaignState::Procurement), DEFAULT_AUTOMATION_ACTOR),
            (Some(CampaignState::Aggregation), Some(CampaignState::Success), DEFAULT_AUTOMATION_ACTOR),
        ]
    );
}

#[tokio::test]
async fn test_success_successor_is_configurable() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 10, 10).await;

    let settings = LifecycleSettings {
        success_successor: CampaignState::Fulfillment,
        actor: "deadline-bot".into(),
        ..LifecycleSettings::default()
    };
    let outcome = LifecycleWorker::new(pool.clone(), settings)
        .process_campaign(&campaign_id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CampaignOutcome::Succeeded { successor: CampaignState::Fulfillment }
    );

    let logs = service.audit_page(Some(&campaign_id), Page::default()).await.unwrap();
    assert_eq!(logs[0].actor, "deadline-bot");
    assert_eq!(logs[0].new_state, Some(CampaignState::Fulfillment));
}

#[tokio::test]
async fn test_campaign_before_deadline_is_not_scanned() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    commit_units(&service, &campaign.id, "ana@example.com", 1).await;

    let report = worker(&pool).run_cycle_at(now_millis()).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(
        service.campaign(&campaign.id).await.unwrap().state,
        CampaignState::Aggregation
    );
}

#[tokio::test]
async fn test_lease_is_granted_once_within_timeout() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 1, 10).await;
    let now = now_millis();

    {
        let mut conn = pool.acquire().await.unwrap();
        assert!(repository::acquire_lease(&mut conn, &campaign_id, now, LEASE_TIMEOUT_MS)
            .await
            .unwrap());
        assert!(!repository::acquire_lease(&mut conn, &campaign_id, now + 1, LEASE_TIMEOUT_MS)
            .await
            .unwrap());
    }

    let worker = worker(&pool);
    let err = worker.process_campaign(&campaign_id).await.unwrap_err();
    assert!(matches!(err, EscrowError::LeaseContention { .. }));

    let report = worker.run_cycle_at(now + 10).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(
        service.campaign(&campaign_id).await.unwrap().state,
        CampaignState::Aggregation
    );
    assert_eq!(count_entries(&pool, &campaign_id, EntryType::Refund).await, 0);
}

#[tokio::test]
async fn test_stale_lease_is_reclaimed() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 2, 10).await;
    let now = now_millis();

    // A worker that crashed while holding the lease.
    {
        let mut conn = pool.acquire().await.unwrap();
        let crashed_at = now - LEASE_TIMEOUT_MS - 1;
        assert!(repository::acquire_lease(&mut conn, &campaign_id, crashed_at, LEASE_TIMEOUT_MS)
            .await
            .unwrap());
    }

    let report = worker(&pool).run_cycle_at(now).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.refunds_issued, 2);
    assert!(service.campaign(&campaign_id).await.unwrap().processing_lock.is_none());
}

#[tokio::test]
async fn test_lease_is_stamped_when_taken_not_when_scanned() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() - 600_000).await;
    commit_units(&service, &campaign.id, "ana@example.com", 1).await;

    // A cycle whose scan time is older than the lease timeout.
    let scanned_at = now_millis() - LEASE_TIMEOUT_MS - 1_000;
    let started = now_millis();
    let report = worker(&pool).run_cycle_at(scanned_at).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.refunds_issued, 1);

    let campaign = service.campaign(&campaign.id).await.unwrap();
    assert!(campaign.processing_lock.is_none());
    let logs = service.audit_page(Some(&campaign.id), Page::default()).await.unwrap();
    let transition = logs
        .iter()
        .find(|log| log.action == AuditAction::StateTransition && log.actor == DEFAULT_AUTOMATION_ACTOR)
        .unwrap();
    assert!(transition.created_at >= started);
}

#[tokio::test]
async fn test_stale_holder_cannot_release_new_lease() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 1, 10).await;
    let now = now_millis();

    let mut conn = pool.acquire().await.unwrap();
    let old = now - LEASE_TIMEOUT_MS - 1;
    assert!(repository::acquire_lease(&mut conn, &campaign_id, old, LEASE_TIMEOUT_MS).await.unwrap());
    assert!(repository::acquire_lease(&mut conn, &campaign_id, now, LEASE_TIMEOUT_MS).await.unwrap());

    assert!(!repository::release_lease(&mut conn, &campaign_id, old).await.unwrap());
    assert!(repository::release_lease(&mut conn, &campaign_id, now).await.unwrap());
}

#[tokio::test]
async fn test_refund_failure_raises_alert_and_batch_continues() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 3, 10).await;
    let commitments = service.commitments(&campaign_id).await.unwrap();
    let broken = &commitments[1];
    break_refunds_for(&pool, &broken.id).await;

    let report = worker(&pool).run_cycle_at(now_millis()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.refunds_issued, 2);
    assert_eq!(report.alerts_raised, 1);

    let alerts = service.open_alerts(Some(&campaign_id), Page::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].commitment_id, broken.id);
    assert!(alerts[0].requires_manual_intervention);
    assert!(alerts[0].error_message.contains("payment provider unavailable"));

    for commitment in service.commitments(&campaign_id).await.unwrap() {
        let expected = if commitment.id == broken.id {
            CommitmentStatus::Locked
        } else {
            CommitmentStatus::Refunded
        };
        assert_eq!(commitment.status, expected);
    }
    assert_eq!(count_entries(&pool, &campaign_id, EntryType::Refund).await, 2);
    assert_eq!(
        service.escrow_summary(&campaign_id).await.unwrap().balance,
        broken.amount
    );

    let campaign = service.campaign(&campaign_id).await.unwrap();
    assert_eq!(campaign.state, CampaignState::Failed);
    assert!(campaign.processing_lock.is_none());
}

#[tokio::test]
async fn test_state_changed_before_lease_is_left_alone() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 2, 10).await;

    // An admin marks it funded between the scan and the lease.
    service
        .transition(&campaign_id, CampaignState::Success, ADMIN, "funded offline")
        .await
        .unwrap();

    let outcome = worker(&pool)
        .process_campaign(&campaign_id)
        .await
        .unwrap();
    assert_eq!(outcome, CampaignOutcome::Skipped { state: CampaignState::Success });

    let campaign = service.campaign(&campaign_id).await.unwrap();
    assert_eq!(campaign.state, CampaignState::Success);
    assert!(campaign.processing_lock.is_none());
    assert_eq!(count_entries(&pool, &campaign_id, EntryType::Refund).await, 0);

    let logs = service.audit_page(Some(&campaign_id), Page::default()).await.unwrap();
    assert!(logs.iter().all(|log| log.actor != DEFAULT_AUTOMATION_ACTOR));
}

#[tokio::test]
async fn test_worker_runs_immediately_and_stops_on_cancel() {
    let (pool, service) = setup().await;
    let campaign_id = due_campaign(&service, None, 1, 10).await;

    let settings = LifecycleSettings {
        interval: Duration::from_secs(3600),
        ..LifecycleSettings::default()
    };
    let worker = LifecycleWorker::new(pool.clone(), settings);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if service.campaign(&campaign_id).await.unwrap().state == CampaignState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
