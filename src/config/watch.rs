/*
 * Copyright 2022 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Re-applies clusters and hosts when the configuration file changes.

use std::{path::Path, sync::Arc, time::Duration};

use notify::Watcher;
use tracing::Instrument;

use super::Config;
use crate::{
    cluster::{ClusterConfigUpdater, ClusterHostUpdater},
    signal::ShutdownRx,
};

/// Watches `path` until `shutdown_rx` fires. Every data change re-reads the
/// file and applies its clusters and hosts to `updater`; listeners are left
/// untouched. A file that fails to parse is logged and ignored.
pub async fn fs<U>(
    updater: Arc<U>,
    path: impl Into<std::path::PathBuf>,
    mut shutdown_rx: ShutdownRx,
) -> crate::Result<()>
where
    U: ClusterConfigUpdater + ClusterHostUpdater + ?Sized,
{
    let path = path.into();
    let span = tracing::info_span!("config_watch", path = %path.display());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut watcher = notify::RecommendedWatcher::new(
        move |res| {
            // The receiver is dropped once the watch stops.
            let _ = tx.send(res);
        },
        Default::default(),
    )?;
    watcher.watch(&path, notify::RecursiveMode::NonRecursive)?;
    span.in_scope(|| tracing::info!("watching configuration file"));

    loop {
        let event = tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = rx.recv() => match event {
                Some(event) => event?,
                None => return Err(eyre::eyre!("filesystem watch unexpectedly stopped")),
            },
        };

        tracing::trace!(parent: &span, event = ?event.kind, "new file event");
        if !matches!(
            event.kind,
            notify::EventKind::Modify(notify::event::ModifyKind::Data(_))
                | notify::EventKind::Modify(notify::event::ModifyKind::Any)
                | notify::EventKind::Create(_)
        ) {
            continue;
        }

        reload(&*updater, &path).instrument(span.clone()).await;
    }

    span.in_scope(|| tracing::info!("stopped watching configuration file"));
    Ok(())
}

const RELOAD_RETRIES: u32 = 3;

async fn reload<U>(updater: &U, path: &Path)
where
    U: ClusterConfigUpdater + ClusterHostUpdater + ?Sized,
{
    tracing::info!("file changed, updating clusters");
    // Editors may still be writing when the event arrives.
    let read = tryhard::retry_fn(|| async move {
        let buf = tokio::fs::read(path).await?;
        Config::from_reader(&*buf)
    })
    .retries(RELOAD_RETRIES)
    .fixed_backoff(Duration::from_millis(50))
    .on_retry(|attempt, _, error: &eyre::Error| {
        let error = error.to_string();
        async move {
            tracing::debug!(attempt, %error, "failed to read configuration, retrying");
        }
    });

    let config = match read.await {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(%error, "ignoring invalid configuration");
            return;
        }
    };

    let report = config.apply(updater);
    for rejected in &report.rejected {
        tracing::warn!(entry = %rejected.entry, error = %rejected.error, "configuration entry rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterManager;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn applies_file_changes() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let file_path = tmp_dir.path().join("meshgate.yaml");
        tokio::fs::write(&file_path, "clusters: []\n").await.unwrap();

        let manager = Arc::new(ClusterManager::new());
        let (tx, rx) = crate::signal::channel(<_>::default());
        let handle = tokio::spawn(fs(manager.clone(), file_path.clone(), rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::fs::write(
            &file_path,
            "clusters:\n  - name: web\nhosts:\n  - cluster: web\n    hosts:\n      - address: 127.0.0.1:8080\n",
        )
        .await
        .unwrap();

        let cluster = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(cluster) = manager.get_cluster_by_name("web") {
                    if !cluster.hosts().is_empty() {
                        break cluster;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(1, cluster.hosts().len());

        tx.send(crate::signal::ShutdownKind::Testing).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_files_are_ignored() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let file_path = tmp_dir.path().join("meshgate.yaml");
        tokio::fs::write(&file_path, "clusters: []\n").await.unwrap();

        let manager = ClusterManager::new();
        reload(&manager, &file_path).await;
        tokio::fs::write(&file_path, "clusters: [").await.unwrap();
        reload(&manager, &file_path).await;

        assert_eq!(0, manager.clusters().len());
    }
}
