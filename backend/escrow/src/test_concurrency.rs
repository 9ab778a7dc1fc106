//! Races between writers on separate connections of a file-backed pool.

use tokio::task::JoinSet;

use crate::db::now_millis;
use crate::errors::EscrowError;
use crate::lifecycle::{LifecycleSettings, LifecycleWorker};
use crate::models::{AuditAction, CommitRequest, CommitmentStatus, EntryType, Page};
use crate::money::Money;
use crate::settlement::{self, SettleOutcome, Settlement};
use crate::state_machine::CampaignState;
use crate::test_utils::*;

const WRITERS: usize = 8;

fn request(participant: &str, quantity: i64) -> CommitRequest {
    CommitRequest {
        participant: participant.to_string(),
        quantity,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_commits_across_connections_execute_once() {
    let (_dir, pool, service) = setup_shared().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;

    let mut set = JoinSet::new();
    for _ in 0..WRITERS {
        let service = service.clone();
        let campaign_id = campaign.id.clone();
        set.spawn(async move {
            service
                .commit(&campaign_id, request("ana@example.com", 3), "shared-key")
                .await
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(executed) => results.push(executed),
            Err(e) => panic!("commit failed with {}: {e}", e.code()),
        }
    }

    assert_eq!(results.iter().filter(|r| r.is_fresh()).count(), 1);
    let ids: Vec<&str> = results
        .iter()
        .map(|r| r.result().unwrap().id.as_str())
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(count_entries(&pool, &campaign.id, EntryType::Lock).await, 1);
    assert_eq!(service.commitments(&campaign.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_transitions_have_one_winner() {
    let (_dir, _pool, service) = setup_shared().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;

    let mut set = JoinSet::new();
    for i in 0..WRITERS {
        let service = service.clone();
        let campaign_id = campaign.id.clone();
        set.spawn(async move {
            service
                .transition(&campaign_id, CampaignState::Failed, ADMIN, &format!("cancelled #{i}"))
                .await
        });
    }

    let mut won = 0;
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(campaign) => {
                assert_eq!(campaign.state, CampaignState::Failed);
                won += 1;
            }
            Err(EscrowError::IllegalTransition { .. } | EscrowError::ConcurrentModification { .. }) => {}
            Err(e) => panic!("transition failed with {}: {e}", e.code()),
        }
    }
    assert_eq!(won, 1);

    let logs = service.audit_page(Some(&campaign.id), Page::default()).await.unwrap();
    let transitions = logs
        .iter()
        .filter(|log| log.action == AuditAction::StateTransition)
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admin_refund_racing_worker_refunds_each_commitment_once() {
    let (_dir, pool, service) = setup_shared().await;
    let campaign = create_campaign(&service, 100, None, now_millis() - 1_000).await;
    for i in 0..6 {
        commit_units(&service, &campaign.id, &format!("p{i}@example.com"), 10).await;
    }

    let worker = LifecycleWorker::new(pool.clone(), LifecycleSettings::default());
    let admin = async {
        // Either side may move the campaign to FAILED first.
        match service
            .transition(&campaign.id, CampaignState::Failed, ADMIN, "supplier cancelled")
            .await
        {
            Ok(_) | Err(EscrowError::IllegalTransition { .. }) => {}
            Err(e) => panic!("transition failed with {}: {e}", e.code()),
        }
        service.refund_campaign(&campaign.id, ADMIN, "admin-refund").await
    };
    let (report, refund) = tokio::join!(worker.run_cycle_at(now_millis()), admin);

    let report = report.unwrap();
    let summary = match refund {
        Ok(executed) => executed.into_result().unwrap(),
        Err(e) => panic!("refund failed with {}: {e}", e.code()),
    };
    assert_eq!(report.alerts_raised, 0);
    assert_eq!(summary.invariant_violations, 0);
    assert_eq!(summary.processed + report.refunds_issued, 6);

    assert!(service.open_alerts(Some(&campaign.id), Page::default()).await.unwrap().is_empty());
    assert_eq!(count_entries(&pool, &campaign.id, EntryType::Refund).await, 6);
    assert_eq!(service.escrow_summary(&campaign.id).await.unwrap().balance, Money::ZERO);
    for commitment in service.commitments(&campaign.id).await.unwrap() {
        assert_eq!(commitment.status, CommitmentStatus::Refunded);
    }
    let logs = service.audit_page(Some(&campaign.id), Page::default()).await.unwrap();
    assert!(logs
        .iter()
        .all(|log| log.action != AuditAction::RefundInvariantError));
}

#[tokio::test]
async fn test_settle_from_stale_snapshot_is_already_settled() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    commit_units(&service, &campaign.id, "ana@example.com", 4).await;
    service
        .transition(&campaign.id, CampaignState::Failed, ADMIN, "supplier cancelled")
        .await
        .unwrap();

    // Read while still LOCKED, then refunded by an admin.
    let snapshot = service.commitments(&campaign.id).await.unwrap().remove(0);
    assert_eq!(snapshot.status, CommitmentStatus::Locked);
    service
        .refund_campaign(&campaign.id, ADMIN, "admin-refund")
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    let outcome = settlement::settle_one(
        &mut tx,
        &snapshot,
        Settlement::Refund,
        "worker",
        "late refund",
        now_millis(),
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(outcome, SettleOutcome::AlreadySettled);
    assert_eq!(count_entries(&pool, &campaign.id, EntryType::Refund).await, 1);
}
