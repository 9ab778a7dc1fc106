use crate::db::now_millis;
use crate::errors::EscrowError;
use crate::ledger::{self, NewLedgerEntry};
use crate::models::{EntryType, Page};
use crate::money::Money;
use crate::state_machine::CampaignState;
use crate::test_utils::*;

#[tokio::test]
async fn test_append_rejects_non_positive_amounts() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    let commitment = commit_units(&service, &campaign.id, "ana@example.com", 1).await;

    let mut conn = pool.acquire().await.unwrap();
    for amount in [Money::ZERO, Money::from_minor(-100)] {
        let err = ledger::append(
            &mut conn,
            &NewLedgerEntry {
                commitment_id: &commitment.id,
                campaign_id: &campaign.id,
                entry_type: EntryType::Refund,
                amount,
                actor: ADMIN,
                reason: "manual",
            },
            now_millis(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)), "{amount}");
    }

    let err = ledger::append(
        &mut conn,
        &NewLedgerEntry {
            commitment_id: &commitment.id,
            campaign_id: &campaign.id,
            entry_type: EntryType::Refund,
            amount: Money::from_minor(100),
            actor: ADMIN,
            reason: "  ",
        },
        now_millis(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
    assert_eq!(ledger::commitment_balance(&mut conn, &commitment.id).await.unwrap(), UNIT_PRICE);
}

#[tokio::test]
async fn test_ledger_rejects_update_and_delete() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    commit_units(&service, &campaign.id, "ana@example.com", 2).await;

    let update = sqlx::query("UPDATE ledger_entries SET amount = 1")
        .execute(&pool)
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM ledger_entries").execute(&pool).await;
    assert!(delete.is_err());

    assert_eq!(count_entries(&pool, &campaign.id, EntryType::Lock).await, 1);
}

#[tokio::test]
async fn test_audit_log_rejects_update_and_delete() {
    let (pool, service) = setup().await;
    create_campaign(&service, 100, None, now_millis() + 60_000).await;

    assert!(sqlx::query("UPDATE admin_action_logs SET reason = 'edited'")
        .execute(&pool)
        .await
        .is_err());
    assert!(sqlx::query("DELETE FROM admin_action_logs")
        .execute(&pool)
        .await
        .is_err());
}

#[tokio::test]
async fn test_commitment_status_only_leaves_locked_once() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    let commitment = commit_units(&service, &campaign.id, "ana@example.com", 1).await;

    service
        .transition(&campaign.id, CampaignState::Failed, ADMIN, "supplier cancelled")
        .await
        .unwrap();
    service.refund_campaign(&campaign.id, ADMIN, "refund-1").await.unwrap();

    for status in ["LOCKED", "RELEASED"] {
        let result = sqlx::query("UPDATE commitments SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(&commitment.id)
            .execute(&pool)
            .await;
        assert!(result.is_err(), "REFUNDED -> {status} must be rejected");
    }

    let result = sqlx::query("UPDATE commitments SET amount = amount + 1 WHERE id = ?1")
        .bind(&commitment.id)
        .execute(&pool)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_balances_are_derived_from_entries() {
    let (pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    let first = commit_units(&service, &campaign.id, "ana@example.com", 2).await;
    commit_units(&service, &campaign.id, "ben@example.com", 3).await;

    let summary = service.escrow_summary(&campaign.id).await.unwrap();
    assert_eq!(summary.locked, Money::from_minor(12_500));
    assert_eq!(summary.balance, Money::from_minor(12_500));
    assert_eq!(
        service.commitment_balance(&first.id).await.unwrap(),
        Money::from_minor(5_000)
    );

    service
        .transition(&campaign.id, CampaignState::Failed, ADMIN, "supplier cancelled")
        .await
        .unwrap();
    service.refund_campaign(&campaign.id, ADMIN, "refund-1").await.unwrap();

    let summary = service.escrow_summary(&campaign.id).await.unwrap();
    assert_eq!(summary.refunded, Money::from_minor(12_500));
    assert_eq!(summary.released, Money::ZERO);
    assert_eq!(summary.balance, Money::ZERO);
    assert_eq!(service.commitment_balance(&first.id).await.unwrap(), Money::ZERO);
    assert_eq!(count_entries(&pool, &campaign.id, EntryType::Refund).await, 2);
}

#[tokio::test]
async fn test_ledger_pages_newest_first() {
    let (_pool, service) = setup().await;
    let campaign = create_campaign(&service, 100, None, now_millis() + 60_000).await;
    for participant in ["a@example.com", "b@example.com", "c@example.com"] {
        commit_units(&service, &campaign.id, participant, 1).await;
    }

    let first = service
        .ledger_page(Some(&campaign.id), Page { limit: Some(2), before: None })
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(first[0].id > first[1].id);

    let rest = service
        .ledger_page(Some(&campaign.id), Page { limit: Some(2), before: Some(first[1].id) })
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert!(rest[0].id < first[1].id);

    let all = service.ledger_page(None, Page::default()).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_unknown_commitment_balance_is_not_found() {
    let (_pool, service) = setup().await;
    let err = service.commitment_balance("missing").await.unwrap_err();
    assert!(matches!(err, EscrowError::NotFound { .. }));
}
