// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer session manager: raw TCP (port 9100) connections to TSPL2 label
// printers, status polling, health classification and label transmission.
//
// Each printer has at most one cached connection.  The registry and the
// connection map share one read/write lock; the socket itself sits behind its
// own mutex so a poll and its response are never interleaved with another
// operation on the same printer.  All socket I/O is bounded by the configured
// connection timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use labelspool_core::config::PrintersConfig;
use labelspool_core::error::{Result, SpoolError};
use labelspool_core::status::{DeviceStatus, STATUS_COMMAND, STATUS_RESPONSE_LEN};
use labelspool_core::types::{Printer, PrinterId, PrinterState};

use crate::notify::{EventKind, Notifier};
use crate::store::SpoolStore;

/// Separator placed between repeated copies of a label stream.
const COPY_SEPARATOR: &str = "\r\n";

/// What the scheduler needs from the device side.
#[async_trait]
pub trait PrinterDevice: Send + Sync {
    /// Transmit `content` `copies` times.  Counts the copies against the
    /// printer's lifetime counter on success.
    async fn print(&self, printer: PrinterId, content: &str, copies: u32) -> Result<()>;

    async fn printer(&self, id: PrinterId) -> Option<Printer>;
}

type Connection = Arc<Mutex<TcpStream>>;

#[derive(Default)]
struct Registry {
    printers: HashMap<PrinterId, Printer>,
    connections: HashMap<PrinterId, Connection>,
    /// Printers paused by an operator.  Polls report them as paused until
    /// they are resumed.
    held: HashSet<PrinterId>,
}

pub struct DeviceManager {
    store: Arc<SpoolStore>,
    notifier: Notifier,
    timeout: Duration,
    health_interval: Duration,
    registry: RwLock<Registry>,
    cancel: CancellationToken,
}

impl DeviceManager {
    /// Build the manager and load every known printer from the store.
    pub fn new(store: Arc<SpoolStore>, notifier: Notifier, config: &PrintersConfig) -> Result<Self> {
        let mut registry = Registry::default();
        for printer in store.list_printers()? {
            if printer.status == PrinterState::Paused {
                registry.held.insert(printer.id);
            }
            registry.printers.insert(printer.id, printer);
        }
        info!(printers = registry.printers.len(), "device manager loaded printers");

        Ok(Self {
            store,
            notifier,
            timeout: config.connection_timeout(),
            health_interval: config.health_check_interval(),
            registry: RwLock::new(registry),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the health-check loop: one sweep immediately, then one per
    /// interval until `shutdown`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let results = this.check_all().await;
                        let failing = results.iter().filter(|(_, r)| r.is_err()).count();
                        debug!(checked = results.len(), failing, "health sweep finished");
                    }
                }
            }
            info!("health-check loop stopped");
        })
    }

    /// Stop the health loop and close every cached connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut registry = self.registry.write().await;
        let closed = registry.connections.len();
        registry.connections.clear();
        info!(closed, "device manager shut down");
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    pub async fn get_printer(&self, id: PrinterId) -> Option<Printer> {
        self.registry.read().await.printers.get(&id).cloned()
    }

    /// All registered printers, ordered by name.
    pub async fn list_printers(&self) -> Vec<Printer> {
        let mut printers: Vec<Printer> =
            self.registry.read().await.printers.values().cloned().collect();
        printers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        printers
    }

    /// Register a printer.  `PrinterId(0)` lets the store pick the id.
    #[instrument(skip(self, printer), fields(name = %printer.name))]
    pub async fn add_printer(&self, mut printer: Printer) -> Result<PrinterId> {
        let mut registry = self.registry.write().await;
        if printer.id.0 != 0 && registry.printers.contains_key(&printer.id) {
            return Err(SpoolError::PrinterExists(printer.id));
        }
        printer.id = self.store.insert_printer(&printer)?;
        let id = printer.id;
        registry.printers.insert(id, printer);
        info!(printer_id = %id, "printer added");
        Ok(id)
    }

    pub async fn remove_printer(&self, id: PrinterId) -> Result<()> {
        let mut registry = self.registry.write().await;
        if !registry.printers.contains_key(&id) {
            return Err(SpoolError::PrinterNotFound(id));
        }
        self.store.delete_printer(id)?;
        registry.printers.remove(&id);
        registry.connections.remove(&id);
        registry.held.remove(&id);
        info!(printer_id = %id, "printer removed");
        Ok(())
    }

    /// Replace a printer's address and geometry.  Status and counters are
    /// kept; the cached connection is dropped so the next operation dials
    /// the new endpoint.
    pub async fn update_printer(&self, printer: Printer) -> Result<()> {
        let mut registry = self.registry.write().await;
        let Some(current) = registry.printers.get(&printer.id) else {
            return Err(SpoolError::PrinterNotFound(printer.id));
        };
        self.store.update_printer(&printer)?;

        let updated = Printer {
            status: current.status,
            last_seen_at: current.last_seen_at,
            total_prints: current.total_prints,
            ..printer
        };
        let id = updated.id;
        registry.printers.insert(id, updated);
        registry.connections.remove(&id);
        debug!(printer_id = %id, "printer updated");
        Ok(())
    }

    /// Hold a printer in `paused` until `resume_printer`.
    pub async fn pause_printer(&self, id: PrinterId) -> Result<()> {
        self.ensure_known(id).await?;
        self.registry.write().await.held.insert(id);
        self.record_status(id, PrinterState::Paused, Some("paused by operator".into()))
            .await;
        Ok(())
    }

    pub async fn resume_printer(&self, id: PrinterId) -> Result<()> {
        self.ensure_known(id).await?;
        self.registry.write().await.held.remove(&id);
        self.record_status(id, PrinterState::Online, Some("resumed by operator".into()))
            .await;
        Ok(())
    }

    async fn ensure_known(&self, id: PrinterId) -> Result<()> {
        if self.registry.read().await.printers.contains_key(&id) {
            Ok(())
        } else {
            Err(SpoolError::PrinterNotFound(id))
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Poll a printer and record the resulting status.
    ///
    /// Connection failures mark the printer offline.  A reply shorter than
    /// four bytes marks it in error and returns `InvalidStatus`.
    #[instrument(skip(self), fields(printer_id = %id))]
    pub async fn check_status(&self, id: PrinterId) -> Result<DeviceStatus> {
        self.ensure_known(id).await?;

        match self.exchange(id, STATUS_COMMAND, true).await {
            Ok(Some(raw)) => {
                let status = DeviceStatus::decode(raw, Utc::now());
                let held = self.registry.read().await.held.contains(&id);
                let state = if held { PrinterState::Paused } else { status.composite() };
                self.record_status(id, state, None).await;
                Ok(status)
            }
            Ok(None) => Err(SpoolError::InvalidStatus("no status response".into())),
            Err(e) => {
                self.drop_connection(id).await;
                let state = match e {
                    SpoolError::InvalidStatus(_) => PrinterState::Error,
                    _ => PrinterState::Offline,
                };
                warn!(printer_id = %id, error = %e, state = %state, "status poll failed");
                self.record_status(id, state, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Poll every registered printer concurrently.
    pub async fn check_all(self: &Arc<Self>) -> Vec<(PrinterId, Result<DeviceStatus>)> {
        let ids: Vec<PrinterId> = self.registry.read().await.printers.keys().copied().collect();

        let mut polls = JoinSet::new();
        for id in ids {
            let this = Arc::clone(self);
            polls.spawn(async move { (id, this.check_status(id).await) });
        }

        let mut results = Vec::with_capacity(polls.len());
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "status poll task failed"),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }

    /// Update the in-memory and persisted status.  `last_seen_at` is stamped
    /// on every call; a change of status is announced.
    async fn record_status(&self, id: PrinterId, state: PrinterState, details: Option<String>) {
        let now = Utc::now();
        let previous = {
            let mut registry = self.registry.write().await;
            let Some(printer) = registry.printers.get_mut(&id) else {
                return;
            };
            let previous = printer.status;
            printer.status = state;
            printer.last_seen_at = Some(now);
            previous
        };

        if let Err(e) = self.store.update_printer_status(id, state, Some(now)) {
            warn!(printer_id = %id, error = %e, "failed to persist printer status");
        }
        if previous != state {
            info!(printer_id = %id, from = %previous, to = %state, "printer status changed");
            self.notifier.emit(EventKind::PrinterStatusChanged {
                printer_id: id,
                previous,
                current: state,
                details,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Transmission
    // -----------------------------------------------------------------------

    /// Write raw commands to a printer, reconnecting once on a failed write.
    pub async fn send_command(&self, id: PrinterId, command: &str) -> Result<()> {
        self.ensure_known(id).await?;
        self.exchange(id, command.as_bytes(), false).await?;
        Ok(())
    }

    async fn print_inner(&self, id: PrinterId, content: &str, copies: u32) -> Result<()> {
        let status = self.check_status(id).await.map_err(|e| match e {
            SpoolError::Connection(_) | SpoolError::Io(_) => SpoolError::PrinterOffline(id),
            other => other,
        })?;
        if !status.is_online {
            return Err(SpoolError::PrinterOffline(id));
        }
        if self.registry.read().await.held.contains(&id) {
            return Err(SpoolError::CannotPrint {
                printer: id,
                state: PrinterState::Paused.to_string(),
            });
        }
        if !status.can_print {
            return Err(SpoolError::CannotPrint {
                printer: id,
                state: status.printer.as_str().to_string(),
            });
        }

        let copies = copies.max(1);
        let payload = vec![content; copies as usize].join(COPY_SEPARATOR);
        self.exchange(id, payload.as_bytes(), false)
            .await
            .map_err(|e| {
                warn!(printer_id = %id, error = %e, "label transmission failed");
                SpoolError::PrinterOffline(id)
            })?;

        if let Some(printer) = self.registry.write().await.printers.get_mut(&id) {
            printer.total_prints += u64::from(copies);
        }
        if let Err(e) = self.store.increment_print_count(id, copies) {
            warn!(printer_id = %id, error = %e, "failed to persist print count");
        }
        info!(printer_id = %id, copies, bytes = payload.len(), "labels transmitted");
        Ok(())
    }

    /// Write `payload` and, when `read_status` is set, read the 4-byte status
    /// reply under the same socket lock.  A failed write discards the cached
    /// connection and is retried once on a fresh one.
    async fn exchange(
        &self,
        id: PrinterId,
        payload: &[u8],
        read_status: bool,
    ) -> Result<Option<[u8; STATUS_RESPONSE_LEN]>> {
        let mut stream = self.connection(id).await?.lock_owned().await;

        if let Err(first) = self.write(&mut stream, payload).await {
            debug!(printer_id = %id, error = %first, "write failed, reconnecting once");
            drop(stream);
            self.drop_connection(id).await;
            stream = self.connection(id).await?.lock_owned().await;
            if let Err(e) = self.write(&mut stream, payload).await {
                drop(stream);
                self.drop_connection(id).await;
                return Err(SpoolError::Connection(format!("write to printer {id}: {e}")));
            }
        }

        if !read_status {
            return Ok(None);
        }
        self.read_status(&mut stream).await.map(Some)
    }

    async fn write(&self, stream: &mut OwnedMutexGuard<TcpStream>, payload: &[u8]) -> std::io::Result<()> {
        let io = async {
            stream.write_all(payload).await?;
            stream.flush().await
        };
        tokio::time::timeout(self.timeout, io).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded")
        })?
    }

    /// Read the status reply.  End of stream or the deadline before four
    /// bytes arrive is an incomplete reply; any other read error is a
    /// connection failure.
    async fn read_status(
        &self,
        stream: &mut OwnedMutexGuard<TcpStream>,
    ) -> Result<[u8; STATUS_RESPONSE_LEN]> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; STATUS_RESPONSE_LEN];
        let mut filled = 0;

        while filled < STATUS_RESPONSE_LEN {
            match tokio::time::timeout_at(deadline, stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(SpoolError::Connection(format!("read status: {e}"))),
            }
        }

        if filled < STATUS_RESPONSE_LEN {
            return Err(SpoolError::InvalidStatus(format!(
                "expected {STATUS_RESPONSE_LEN} bytes, got {filled}"
            )));
        }
        Ok(buf)
    }

    /// The cached connection, dialling a new one if none is cached.
    async fn connection(&self, id: PrinterId) -> Result<Connection> {
        let endpoint = {
            let registry = self.registry.read().await;
            if let Some(conn) = registry.connections.get(&id) {
                return Ok(Arc::clone(conn));
            }
            registry
                .printers
                .get(&id)
                .map(Printer::endpoint)
                .ok_or(SpoolError::PrinterNotFound(id))?
        };

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| {
                SpoolError::Connection(format!(
                    "connect to {endpoint} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| SpoolError::Connection(format!("connect to {endpoint}: {e}")))?;
        debug!(printer_id = %id, endpoint = %endpoint, "printer connected");

        let mut registry = self.registry.write().await;
        let conn = registry
            .connections
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(stream)));
        Ok(Arc::clone(conn))
    }

    async fn drop_connection(&self, id: PrinterId) {
        if self.registry.write().await.connections.remove(&id).is_some() {
            debug!(printer_id = %id, "connection discarded");
        }
    }
}

#[async_trait]
impl PrinterDevice for DeviceManager {
    async fn print(&self, printer: PrinterId, content: &str, copies: u32) -> Result<()> {
        self.print_inner(printer, content, copies).await
    }

    async fn printer(&self, id: PrinterId) -> Option<Printer> {
        self.get_printer(id).await
    }
}
