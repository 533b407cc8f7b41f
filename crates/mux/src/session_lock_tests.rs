// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;

fn lock_map() -> SessionLockMap {
    SessionLockMap::new(Arc::new(Metrics::new()))
}

#[tokio::test]
async fn lock_is_exclusive_per_id() -> anyhow::Result<()> {
    let locks = Arc::new(lock_map());

    let guard = locks.acquire("s1").await.map_err(|e| anyhow::anyhow!(e.message))?;

    // A second acquire on the same id waits; it only proceeds after
    // the first guard drops.
    let locks2 = Arc::clone(&locks);
    let second = tokio::spawn(async move { locks2.acquire("s1").await.is_ok() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    drop(guard);
    assert!(second.await?);
    Ok(())
}

#[tokio::test]
async fn different_ids_do_not_contend() -> anyhow::Result<()> {
    let locks = lock_map();
    let _a = locks.acquire("s1").await.map_err(|e| anyhow::anyhow!(e.message))?;
    let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("s2")).await;
    assert!(b.is_ok());
    Ok(())
}

#[tokio::test]
async fn prune_keeps_held_locks() -> anyhow::Result<()> {
    let locks = lock_map();
    let guard = locks.acquire("s1").await.map_err(|e| anyhow::anyhow!(e.message))?;
    let _free = locks.acquire("s2").await.map_err(|e| anyhow::anyhow!(e.message))?;
    drop(_free);

    locks.prune_idle();
    // s2 is gone, s1 survives while held; re-acquiring s1 still waits.
    let locks = Arc::new(locks);
    let locks2 = Arc::clone(&locks);
    let second = tokio::spawn(async move { locks2.acquire("s1").await.is_ok() });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!second.is_finished());
    drop(guard);
    assert!(second.await?);
    Ok(())
}
