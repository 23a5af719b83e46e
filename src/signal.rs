/*
 * Copyright 2023 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Process shutdown notification.

/// Receiver for a shutdown event.
pub type ShutdownRx = tokio::sync::watch::Receiver<ShutdownKind>;
pub type ShutdownTx = tokio::sync::watch::Sender<ShutdownKind>;

/// Spawns a task waiting for SIGINT or SIGTERM and returns a receiver that
/// changes once either arrives.
pub fn spawn_handler() -> std::io::Result<ShutdownRx> {
    let (tx, rx) = channel(ShutdownKind::default());
    ShutdownKind::spawn_signal_handler(tx)?;
    Ok(rx)
}

pub fn channel(kind: ShutdownKind) -> (ShutdownTx, ShutdownRx) {
    tokio::sync::watch::channel(kind)
}

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum ShutdownKind {
    /// Drain listeners and stop health checking.
    #[default]
    Normal,
    /// Sent by tests, which may skip parts of the shutdown.
    Testing,
}

impl ShutdownKind {
    fn spawn_signal_handler(shutdown_tx: ShutdownTx) -> std::io::Result<()> {
        crate::metrics::shutdown_initiated().set(false as _);

        #[cfg(unix)]
        let mut sig_term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::spawn(async move {
            #[cfg(unix)]
            let sig_term = sig_term.recv();
            #[cfg(not(unix))]
            let sig_term = std::future::pending::<Option<()>>();

            let signal = tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sig_term => "SIGTERM",
            };

            crate::metrics::shutdown_initiated().set(true as _);
            tracing::info!(%signal, "shutting down from signal");
            // Receivers may already be gone.
            shutdown_tx.send(Self::Normal).ok();
        });

        Ok(())
    }
}
