//! End-to-end refresh cycles: tick → lane → provider → upsert

mod helpers;

use chrono::Duration as ChronoDuration;
use helpers::{build_harness, wait_for, HarnessOptions, ScriptedProvider, PROVIDER};
use scout_common::events::ScoutEvent;
use scout_common::time::now_millis;
use scout_refresh::db::EntityStore;
use scout_refresh::models::{AffiliationStatus, EntityPayload, FetchResult};
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_never_refreshed_company_is_confirmed_at_tick_time() {
    let harness = build_harness(ScriptedProvider::new(PROVIDER), HarnessOptions::default(), None).await;
    let id = harness.company("Acme Robotics").await;

    let payload: EntityPayload =
        serde_json::from_value(json!({"name": "Acme", "affiliation_status": "confirmed"})).unwrap();
    harness.provider.script(id, vec![FetchResult::Success(payload)]);

    let mut rx = harness.bus.subscribe();
    harness.pool.start().await;

    let tick_at = now_millis();
    let report = harness.scheduler.run_tick_at(tick_at).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.enqueued, 1);

    let refreshed_at = wait_for(&mut rx, WAIT, |e| match e {
        ScoutEvent::RefreshSucceeded {
            entity_id,
            refreshed_at,
            attempts,
            ..
        } if *entity_id == id => {
            assert_eq!(*attempts, 0);
            Some(*refreshed_at)
        }
        _ => None,
    })
    .await;
    assert_eq!(refreshed_at, tick_at);

    let entity = harness.store.load_entity(id).await.unwrap().unwrap();
    assert_eq!(entity.name, "Acme");
    assert_eq!(entity.affiliation_status, AffiliationStatus::Confirmed);
    assert_eq!(entity.last_refreshed_at, Some(tick_at));
    assert_eq!(entity.refresh_blocked_until, None);

    harness.pool.wait_idle().await;
    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_permanent_error_blocks_entity_for_one_threshold() {
    let options = HarnessOptions::default();
    let threshold = options.threshold;
    let harness = build_harness(ScriptedProvider::new(PROVIDER), options, None).await;

    let id = harness.company("Beta Labs").await;
    let last_good = now_millis() - ChronoDuration::hours(48);
    harness.refreshed_at(id, last_good).await;
    harness
        .provider
        .script(id, vec![FetchResult::permanent("profile not found")]);

    let mut rx = harness.bus.subscribe();
    harness.pool.start().await;

    let tick_at = now_millis();
    assert_eq!(harness.scheduler.run_tick_at(tick_at).await.unwrap().selected, 1);

    let blocked_until = wait_for(&mut rx, WAIT, |e| match e {
        ScoutEvent::RefreshFailedPermanent {
            entity_id,
            blocked_until,
            cause,
            ..
        } if *entity_id == id => {
            assert_eq!(cause, "profile not found");
            Some(*blocked_until)
        }
        _ => None,
    })
    .await;
    harness.pool.wait_idle().await;

    let entity = harness.store.load_entity(id).await.unwrap().unwrap();
    assert_eq!(entity.last_refreshed_at, Some(last_good));
    assert_eq!(entity.refresh_blocked_until, Some(blocked_until));
    assert!(blocked_until >= tick_at + scout_common::time::to_chrono(threshold));

    let (cause, until) = harness.store.load_failure(id, PROVIDER).await.unwrap().unwrap();
    assert_eq!(cause, "profile not found");
    assert_eq!(until, blocked_until);

    // Still stale, but blocked for the rest of the threshold period
    let later = tick_at + ChronoDuration::hours(1);
    assert_eq!(harness.scheduler.run_tick_at(later).await.unwrap().selected, 0);

    // Eligible again once the block lapses
    let after_block = blocked_until + ChronoDuration::milliseconds(1);
    assert_eq!(harness.scheduler.run_tick_at(after_block).await.unwrap().selected, 1);

    harness.pool.wait_idle().await;
    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_rate_limited_three_times_then_success() {
    let harness = build_harness(ScriptedProvider::new(PROVIDER), HarnessOptions::default(), None).await;
    let id = harness.founder("Jane Doe").await;

    let limited = FetchResult::RateLimited {
        retry_after: Duration::from_millis(3),
    };
    harness.provider.script(
        id,
        vec![
            limited.clone(),
            limited.clone(),
            limited,
            FetchResult::Success(EntityPayload {
                title: Some("CEO".to_string()),
                ..Default::default()
            }),
        ],
    );

    let mut rx = harness.bus.subscribe();
    harness.pool.start().await;
    harness.scheduler.run_tick_at(now_millis()).await.unwrap();

    let mut delays = Vec::new();
    let attempts = wait_for(&mut rx, WAIT, |e| match e {
        ScoutEvent::RefreshRetryScheduled {
            entity_id,
            delay_ms,
            attempt,
            ..
        } if *entity_id == id => {
            delays.push(*delay_ms);
            assert_eq!(*attempt as usize, delays.len());
            None
        }
        ScoutEvent::RefreshSucceeded {
            entity_id, attempts, ..
        } if *entity_id == id => Some(*attempts),
        ScoutEvent::RefreshAbandoned { entity_id, .. } if *entity_id == id => {
            panic!("task abandoned before succeeding")
        }
        _ => None,
    })
    .await;

    assert_eq!(attempts, 3);
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "delays decreased: {:?}", delays);
    assert_eq!(harness.provider.calls_for(id), 4);

    let entity = harness.store.load_entity(id).await.unwrap().unwrap();
    assert_eq!(entity.title.as_deref(), Some("CEO"));

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_transient_errors_past_ceiling_leave_timestamp_alone() {
    let options = HarnessOptions {
        retry_ceiling: 2,
        ..Default::default()
    };
    let provider = ScriptedProvider::new(PROVIDER).with_default(FetchResult::transient("503 from upstream"));
    let harness = build_harness(provider, options, None).await;
    let id = harness.company("Gamma").await;

    let mut rx = harness.bus.subscribe();
    harness.pool.start().await;
    let tick_at = now_millis();
    harness.scheduler.run_tick_at(tick_at).await.unwrap();

    let attempts = wait_for(&mut rx, WAIT, |e| match e {
        ScoutEvent::RefreshAbandoned {
            entity_id, attempts, ..
        } if *entity_id == id => Some(*attempts),
        _ => None,
    })
    .await;
    assert_eq!(attempts, 2);
    harness.pool.wait_idle().await;

    let entity = harness.store.load_entity(id).await.unwrap().unwrap();
    assert_eq!(entity.last_refreshed_at, None);
    assert_eq!(entity.refresh_blocked_until, None);

    // Abandoned, not blocked: the next tick picks it up again
    let report = harness
        .scheduler
        .run_tick_at(tick_at + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert_eq!(report.selected, 1);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_success_requests_scoring() {
    let harness = build_harness(ScriptedProvider::new(PROVIDER), HarnessOptions::default(), None).await;
    let id = harness.company("Delta").await;
    harness.provider.script(
        id,
        vec![FetchResult::Success(EntityPayload {
            summary: Some("Robotics for labs".to_string()),
            ..Default::default()
        })],
    );

    harness.pool.start().await;
    harness.scheduler.run_tick_at(now_millis()).await.unwrap();
    harness.pool.wait_idle().await;

    // Scoring hand-off is fire-and-forget; give it a moment to land
    let mut pending = Vec::new();
    for _ in 0..100 {
        pending = harness.scoring.pending().await.unwrap();
        if !pending.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pending, vec![id]);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_tick_records_run_and_emits_completion() {
    let harness = build_harness(ScriptedProvider::new(PROVIDER), HarnessOptions::default(), None).await;
    harness.company("Epsilon").await;
    harness.company("Zeta").await;

    let mut rx = harness.bus.subscribe();
    harness.pool.start().await;
    let tick_at = now_millis();
    harness.scheduler.run_tick_at(tick_at).await.unwrap();

    let (selected, enqueued) = wait_for(&mut rx, WAIT, |e| match e {
        ScoutEvent::TickCompleted { selected, enqueued, .. } => Some((*selected, *enqueued)),
        _ => None,
    })
    .await;
    assert_eq!((selected, enqueued), (2, 2));

    let last = harness.store.last_run_started("tick").await.unwrap();
    assert_eq!(last, Some(tick_at));

    harness.pool.wait_idle().await;
    harness.pool.shutdown(Duration::from_secs(1)).await;
}
