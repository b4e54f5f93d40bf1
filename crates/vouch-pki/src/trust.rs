//! Trust-pool state with revocation snapshots.
//!
//! Holds the pool's root certificates (immutable after construction) and a
//! set of revoked serial numbers rebuilt atomically on every refresh. The
//! refresher re-arms itself for `now + max_interval`, tightened to the
//! earliest `nextUpdate` any accepted CRL advertises.
//!
//! # Locking
//!
//! Two locks, deliberately separate:
//!
//! - `refresh_guard` (async) serializes refreshes so the timer and a manual
//!   refresh never overlap.
//! - `revoked` (sync RwLock) guards the snapshot. The write half is taken
//!   only at the end of `refresh`, never while awaiting, so handshake-path
//!   readers cannot deadlock against an in-flight refresh.
//!
//! Do not merge them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{error, info, warn};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;

use vouch_core::gcp::DEFAULT_SCOPE;

use crate::authority::{AccessTokenSource, CertificateAuthorityClient};
use crate::cert::{hex_encode, CertificatePem};
use crate::{Error, Result};

/// Trust anchors plus the current revocation snapshot for one CA pool.
pub struct RevocationList {
    /// Root certificates of the pool. Built once, never mutated.
    anchors: Vec<CertificatePem>,
    /// Revoked serials in lowercase hex. Replaced wholesale per refresh.
    revoked: RwLock<HashSet<String>>,
    /// Serializes refreshes. MUST NOT be held while taking `revoked` for
    /// writing anywhere outside `refresh`.
    refresh_guard: Mutex<()>,
    /// When the background refresher should fire next.
    next_refresh_at: RwLock<DateTime<Utc>>,
    /// Wakes the refresher after `next_refresh_at` changes.
    schedule_changed: Notify,
    ca: CertificateAuthorityClient,
    tokens: Arc<dyn AccessTokenSource>,
    max_interval: Duration,
    shutdown: watch::Sender<bool>,
    refresher_started: AtomicBool,
}

impl RevocationList {
    /// Creates an empty revocation list. Call [`refresh`](Self::refresh) once
    /// to populate it.
    pub fn new(
        anchors: Vec<CertificatePem>,
        ca: CertificateAuthorityClient,
        tokens: Arc<dyn AccessTokenSource>,
        max_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            anchors,
            revoked: RwLock::new(HashSet::new()),
            refresh_guard: Mutex::new(()),
            next_refresh_at: RwLock::new(Utc::now() + to_chrono(max_interval)),
            schedule_changed: Notify::new(),
            ca,
            tokens,
            max_interval,
            shutdown,
            refresher_started: AtomicBool::new(false),
        })
    }

    /// Returns the trust anchors.
    pub fn anchors(&self) -> &[CertificatePem] {
        &self.anchors
    }

    /// True iff some trust anchor's public key verifies `cert`'s signature.
    pub fn is_issued_by_pool(&self, cert: &CertificatePem) -> bool {
        self.anchors.iter().any(|anchor| cert.is_signed_by(anchor))
    }

    /// True if the certificate is absent, has no serial, or is revoked.
    pub fn is_revoked(&self, cert: Option<&CertificatePem>) -> bool {
        let Some(cert) = cert else {
            return true;
        };
        match cert.serial_hex() {
            Ok(serial) if !serial.is_empty() => self.is_serial_revoked(&serial),
            _ => true,
        }
    }

    /// True if the hex serial is present in the current snapshot.
    pub fn is_serial_revoked(&self, hex_serial: &str) -> bool {
        self.revoked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hex_serial)
    }

    /// Fetches the authority description and all advertised CRLs, then
    /// atomically replaces the snapshot.
    ///
    /// Individual CRL failures are logged and skipped; the refresh fails
    /// overall only when the authority description cannot be fetched. Returns
    /// the time the next refresh should run.
    pub async fn refresh(&self) -> Result<DateTime<Utc>> {
        let _serialized = self.refresh_guard.lock().await;
        let now = Utc::now();

        info!("updating revoked certificate list");

        let token = self
            .tokens
            .access_token(&[DEFAULT_SCOPE])
            .await
            .map_err(Error::Authority)?;
        let authority = self.ca.get_authority(&token).await?;

        let (crls, failures) = self.ca.fetch_crls(&authority).await;
        for failure in failures {
            warn!(error = %failure, "skipping CRL source");
        }

        let ceiling = now + to_chrono(self.max_interval);
        let (snapshot, next_at) = build_snapshot(&self.anchors, &crls, now, ceiling);

        info!(count = snapshot.len(), next_refresh = %next_at, "updated revoked certificate list");

        // The only place the snapshot write lock is taken. Readers between
        // the swap see either the full old set or the full new one.
        *self
            .revoked
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;

        *self
            .next_refresh_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next_at;
        self.schedule_changed.notify_waiters();

        Ok(next_at)
    }

    /// Spawns the background refresher. Idempotent; returns false if it is
    /// already running.
    pub fn start_auto_refresh(self: &Arc<Self>) -> bool {
        if self
            .refresher_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _ = self.shutdown.send(false);
        let state = Arc::clone(self);
        tokio::spawn(state.run_refresh_loop());
        true
    }

    /// Stops the background refresher. Idempotent.
    pub fn stop_auto_refresh(&self) {
        self.refresher_started.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let target = *self
                .next_refresh_at
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let wait = (target - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(err) = self.refresh().await {
                        error!(error = %err, "failed to refresh revocation list");
                        *self
                            .next_refresh_at
                            .write()
                            .unwrap_or_else(PoisonError::into_inner) =
                            Utc::now() + to_chrono(self.max_interval);
                    }
                }
                _ = self.schedule_changed.notified() => {
                    // A refresh elsewhere moved the schedule; re-read it.
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("CRL refresher shutting down");
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RevocationList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationList")
            .field("anchors", &self.anchors.len())
            .field("max_interval", &self.max_interval)
            .finish()
    }
}

/// Builds a fresh snapshot from raw CRLs.
///
/// CRLs not signed by any anchor are dropped. `next_at` starts at the policy
/// ceiling and is tightened to any accepted CRL's `nextUpdate` that lies in
/// `(now, next_at)`.
fn build_snapshot(
    anchors: &[CertificatePem],
    crls: &[Vec<u8>],
    now: DateTime<Utc>,
    ceiling: DateTime<Utc>,
) -> (HashSet<String>, DateTime<Utc>) {
    let mut revoked = HashSet::new();
    let mut next_at = ceiling;

    for der in crls {
        let Ok((_, crl)) = CertificateRevocationList::from_der(der) else {
            warn!("failed to parse CRL, skipping");
            continue;
        };

        let signed_by_anchor = anchors.iter().any(|anchor| {
            x509_parser::parse_x509_certificate(anchor.der())
                .map(|(_, parsed)| crl.verify_signature(parsed.public_key()).is_ok())
                .unwrap_or(false)
        });
        if !signed_by_anchor {
            error!("CRL is not signed by any trust anchor, skipping");
            continue;
        }

        if let Some(next_update) = crl.next_update() {
            if let Some(advertised) = DateTime::from_timestamp(next_update.timestamp(), 0) {
                info!(next_update = %advertised, "CRL advertises next update");
                if advertised > now && advertised < next_at {
                    next_at = advertised;
                }
            }
        }

        for entry in crl.iter_revoked_certificates() {
            let serial = hex_encode(entry.raw_serial());
            if serial.is_empty() {
                warn!("revoked certificate entry has no serial number");
                continue;
            }
            revoked.insert(serial);
        }
    }

    (revoked, next_at)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(24))
}
