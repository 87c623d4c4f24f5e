//! Preference cache and reconciler integration tests
//!
//! - onboardingComplete never regresses, whatever the server says
//! - reconciliation is skipped once fully onboarded
//! - concurrent reconciliations for one identifier share one network call
//! - a superseded reconciliation never applies its result
//! - the file-backed store survives a restart

mod common;

use common::{id, MockPreferences};
use rkd_common::events::EventBus;
use rkd_common::{RemoteEntitySummary, Variant};
use rkd_sync::models::{PreferenceField, PreferencePatch};
use rkd_sync::preferences::{FileStore, MemoryStore, PreferenceCache, PreferenceStore, Reconciler};
use rkd_sync::providers::ServerPreferences;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn memory_cache() -> PreferenceCache {
    PreferenceCache::open(Arc::new(MemoryStore::new()), 5)
}

#[tokio::test]
async fn test_onboarding_complete_never_regresses() {
    let cache = memory_cache();
    cache
        .write(PreferencePatch::new().onboarding_complete(true))
        .unwrap();

    let provider = MockPreferences::new().responding(ServerPreferences {
        onboarding_complete: false,
        variant_preference: Some(Variant::Blitz),
        goal: None,
    });
    let reconciler = Reconciler::new(cache.clone(), provider.clone(), EventBus::default());

    reconciler.reconcile(&id("magnus")).await;

    let record = cache.read();
    assert!(record.onboarding_complete);
    assert_eq!(record.variant_preference, Some(Variant::Blitz));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn test_fully_onboarded_user_skips_reconciliation() {
    let cache = memory_cache();
    cache
        .write(
            PreferencePatch::new()
                .onboarding_complete(true)
                .variant_preference(Variant::Rapid),
        )
        .unwrap();
    let provider = MockPreferences::new().responding(ServerPreferences::default());
    let reconciler = Reconciler::new(cache, provider.clone(), EventBus::default());

    reconciler.reconcile_if_needed(&id("magnus")).await;

    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_local_choice_survives_unconfirmed_server_value() {
    let cache = memory_cache();
    cache
        .write(PreferencePatch::new().variant_preference(Variant::Rapid).goal("fun"))
        .unwrap();
    let provider = MockPreferences::new().responding(ServerPreferences {
        onboarding_complete: false,
        variant_preference: Some(Variant::Blitz),
        goal: Some("titled".to_string()),
    });
    let reconciler = Reconciler::new(cache.clone(), provider, EventBus::default());

    reconciler.reconcile_if_needed(&id("magnus")).await;

    let record = cache.read();
    assert_eq!(record.variant_preference, Some(Variant::Rapid));
    assert_eq!(record.goal.as_deref(), Some("fun"));
    assert!(!record.onboarding_complete);
    assert_eq!(
        cache.touched_fields(),
        vec![PreferenceField::VariantPreference, PreferenceField::Goal],
        "local choices stay unconfirmed"
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reconciliations_share_one_call() {
    let cache = memory_cache();
    let provider = MockPreferences::new()
        .responding(ServerPreferences {
            onboarding_complete: true,
            variant_preference: Some(Variant::Blitz),
            goal: None,
        })
        .with_delay(Duration::from_millis(200));
    let reconciler = Reconciler::new(cache.clone(), provider.clone(), EventBus::default());

    let magnus = id("magnus");
    let shouted = id("MAGNUS");
    tokio::join!(
        reconciler.reconcile(&magnus),
        reconciler.reconcile(&shouted),
        reconciler.reconcile(&magnus),
    );

    assert_eq!(provider.call_count(), 1);
    assert!(cache.read().onboarding_complete);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_reconciliation_is_discarded() {
    let cache = memory_cache();
    let provider = MockPreferences::new()
        .responding(ServerPreferences {
            onboarding_complete: false,
            variant_preference: Some(Variant::Blitz),
            goal: None,
        })
        .with_delay(Duration::from_millis(200));
    let reconciler = Arc::new(Reconciler::new(cache.clone(), provider.clone(), EventBus::default()));

    let first = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.reconcile(&id("magnus")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    provider.set_response(Some(ServerPreferences {
        onboarding_complete: false,
        variant_preference: Some(Variant::Rapid),
        goal: None,
    }));
    reconciler.reconcile(&id("hikaru")).await;
    first.await.unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(cache.read().variant_preference, Some(Variant::Rapid));
}

#[tokio::test]
async fn test_failed_reconciliation_keeps_local_state() {
    let cache = memory_cache();
    cache.write(PreferencePatch::new().goal("casual")).unwrap();
    let provider = MockPreferences::new();
    let reconciler = Reconciler::new(cache.clone(), provider.clone(), EventBus::default());

    reconciler.reconcile(&id("magnus")).await;

    assert_eq!(provider.call_count(), 1);
    assert_eq!(cache.read().goal.as_deref(), Some("casual"));
}

#[test]
fn test_file_store_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let summary = RemoteEntitySummary::confirmed(&id("Magnus"), Some("Magnus C.".to_string()), None);

    {
        let store: Arc<dyn PreferenceStore> = Arc::new(FileStore::open(temp_dir.path()).unwrap());
        let cache = PreferenceCache::open(store, 5);
        cache
            .write(PreferencePatch::new().variant_preference(Variant::Blitz))
            .unwrap();
        cache.remember_recent(&summary).unwrap();
        assert!(cache.claim_remembered_identity(&summary).unwrap());
    }

    let store: Arc<dyn PreferenceStore> = Arc::new(FileStore::open(temp_dir.path()).unwrap());
    let cache = PreferenceCache::open(store, 5);
    let record = cache.read();
    assert_eq!(record.variant_preference, Some(Variant::Blitz));
    assert!(cache.is_remembered(&id("magnus")));
    assert_eq!(cache.find_recent("MAGNUS"), Some(summary));
}

#[test]
fn test_recent_identities_bounded_and_deduplicated() {
    let cache = memory_cache();
    for name in ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "ALPHA"] {
        let summary = RemoteEntitySummary::confirmed(&id(name), None, None);
        cache.remember_recent(&summary).unwrap();
    }

    let recent = cache.recent();
    let names: Vec<_> = recent.iter().map(|s| s.identifier.normalized().to_string()).collect();
    assert_eq!(names, vec!["alpha", "foxtrot", "echo", "delta", "charlie"]);
}
