//! Shared fixtures: a temp-file SQLite store and a kernel wired to the
//! scripted collaborator stubs.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use fleet_core::kernel::settings::SettingsService;
use fleet_core::kernel::upstream::testing::{
    SessionScript, StubBrowserManager, StubUpstreamClient, StubWatermarkRewriter,
};
use fleet_core::kernel::Kernel;
use fleet_core::store::scans::SessionSnapshot;
use fleet_core::store::Store;

pub struct TestStore {
    pub store: Arc<Store>,
    _dir: TempDir,
}

pub async fn test_store() -> TestStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fleet-test.db");
    let store = Store::connect(path.to_str().expect("utf8 path"))
        .await
        .expect("open test store");
    TestStore {
        store: Arc::new(store),
        _dir: dir,
    }
}

pub struct TestKernel {
    pub kernel: Arc<Kernel>,
    pub script: Arc<SessionScript>,
    pub watermark: Arc<StubWatermarkRewriter>,
    _dir: TempDir,
}

/// Kernel over a fresh store with scripted collaborators and fast poll
/// intervals. `profiles` seeds the browser stub (not the scan tables).
pub async fn test_kernel(profiles: Vec<(i64, SessionSnapshot)>) -> TestKernel {
    let fixture = test_store().await;
    let store = fixture.store;

    let settings = Arc::new(
        SettingsService::load(Arc::clone(&store))
            .await
            .expect("load settings"),
    );
    let mut system = settings.system();
    system.sora.generate_poll_interval_sec = 1;
    system.sora.generate_max_minutes = 1;
    system.sora.draft_wait_timeout_minutes = 1;
    settings.update_system(system).await.expect("tune settings");

    let script = Arc::new(SessionScript::default());
    let mut browser = StubBrowserManager::new(Arc::clone(&script));
    for (profile_id, snapshot) in profiles {
        browser = browser.with_profile(profile_id, snapshot);
    }
    let watermark = Arc::new(StubWatermarkRewriter::new());

    let kernel = Arc::new(Kernel::new(
        store,
        settings,
        Arc::new(browser),
        Arc::new(StubUpstreamClient {
            script: Arc::clone(&script),
        }),
        Arc::clone(&watermark) as Arc<dyn fleet_core::kernel::upstream::WatermarkRewriter>,
    ));

    TestKernel {
        kernel,
        script,
        watermark,
        _dir: fixture._dir,
    }
}

pub fn active_snapshot(remaining: i64, total: i64) -> SessionSnapshot {
    SessionSnapshot {
        profile_name: None,
        session_status: "active".to_string(),
        plan_type: "plus".to_string(),
        remaining_count: Some(remaining),
        total_count: Some(total),
        reset_at: Some(Utc::now() + chrono::Duration::hours(12)),
        cooldown_until: None,
        error: None,
    }
}

/// Seed one scan run with a result row per profile, so the dispatcher has
/// a candidate universe.
pub async fn seed_scan(store: &Store, group: &str, entries: &[(i64, SessionSnapshot)]) {
    let run_id = store.create_scan_run(group, Some("test")).await.expect("run");
    for (profile_id, snapshot) in entries {
        store
            .insert_scan_result(run_id, group, *profile_id, snapshot, None)
            .await
            .expect("result");
    }
    store
        .finish_scan_run(run_id, "completed", entries.len() as i64, entries.len() as i64, 0, None)
        .await
        .expect("finish run");
}
