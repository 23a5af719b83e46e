/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

use std::{fs::OpenOptions, io, path::Path, time::SystemTime};

use serde::Serialize;
use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::host::HealthStatus;

/// A health status transition, written as one JSON line.
#[derive(Debug, Serialize)]
pub struct HealthEvent<'a> {
    pub timestamp: String,
    pub cluster: &'a str,
    pub host: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub reason: &'a str,
}

impl<'a> HealthEvent<'a> {
    pub fn new(
        cluster: &'a str,
        host: String,
        (from, to): (HealthStatus, HealthStatus),
        reason: &'a str,
    ) -> Self {
        Self {
            timestamp: humantime_serde::re::humantime::format_rfc3339_millis(SystemTime::now())
                .to_string(),
            cluster,
            host,
            from,
            to,
            reason,
        }
    }
}

/// Append only transition log shared by the check loops of a cluster. Lines
/// are written by a background task so recording never blocks a check loop.
#[derive(Debug)]
pub struct EventLog {
    lines: mpsc::UnboundedSender<Vec<u8>>,
}

impl EventLog {
    /// Opens `path` for appending and spawns its writer task, which exits once
    /// the log is dropped.
    pub fn open(path: &Path) -> io::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (lines, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let span = tracing::debug_span!("event_log", path = %path.display());
        runtime.spawn(tracing::Instrument::instrument(
            async move {
                let mut file = tokio::fs::File::from_std(file);
                while let Some(line) = rx.recv().await {
                    if let Err(error) = write_line(&mut file, &line).await {
                        tracing::warn!(%error, "failed to write health check event");
                    }
                }
            },
            span,
        ));

        Ok(Self { lines })
    }

    pub fn record(&self, event: &HealthEvent<'_>) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "failed to encode health check event");
                return;
            }
        };
        line.push(b'\n');

        if self.lines.send(line).is_err() {
            tracing::warn!("health check event log writer stopped");
        }
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &[u8]) -> io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::open(&path).unwrap();

        log.record(&HealthEvent::new(
            "backend",
            "127.0.0.1:80".into(),
            (HealthStatus::Unknown, HealthStatus::Healthy),
            "success",
        ));
        log.record(&HealthEvent::new(
            "backend",
            "127.0.0.1:80".into(),
            (HealthStatus::Healthy, HealthStatus::Unhealthy),
            "timeout",
        ));

        let contents = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let contents = tokio::fs::read_to_string(&path).await.unwrap();
                if contents.ends_with('\n') && contents.lines().count() == 2 {
                    break contents;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(2, lines.len());
        assert_eq!("HEALTHY", lines[0]["to"]);
        assert_eq!("UNHEALTHY", lines[1]["to"]);
        assert_eq!("timeout", lines[1]["reason"]);
    }

    #[test]
    fn open_needs_a_runtime() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EventLog::open(&dir.path().join("events.log")).is_err());
    }
}
