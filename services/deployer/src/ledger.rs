//! Resource ledger: admission control against a fixed CPU/memory ceiling.
//!
//! Every reservation, provisional or confirmed, counts against the ceiling.
//! All operations run under one mutex, so two admissions racing for the last
//! slice of capacity cannot both succeed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use quark_id::{ApplicationId, ReservationId};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Resources;

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Maximum total committed resources across all reservations.
    pub ceiling: Resources,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ceiling: Resources::new(4.0, 14 * 1024),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    /// Committing the request would exceed the ceiling in CPU or memory.
    #[error(
        "admission denied: requested {requested_cpu} cpu / {requested_memory_mb} MB, \
         committed {committed_cpu} cpu / {committed_memory_mb} MB, \
         ceiling {ceiling_cpu} cpu / {ceiling_memory_mb} MB"
    )]
    AdmissionDenied {
        requested_cpu: f64,
        requested_memory_mb: u64,
        committed_cpu: f64,
        committed_memory_mb: u64,
        ceiling_cpu: f64,
        ceiling_memory_mb: u64,
    },

    #[error("unknown reservation: {0}")]
    UnknownReservation(ReservationId),
}

/// Whether a reservation backs a live container yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Held for an in-flight deployment.
    Provisional,
    /// Backing a container that took traffic.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub application_id: ApplicationId,
    pub cpu_millicores: u64,
    pub memory_mb: u64,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

/// Totals currently committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerUsage {
    pub cpu_millicores: u64,
    pub memory_mb: u64,
    pub provisional: usize,
    pub confirmed: usize,
}

impl LedgerUsage {
    pub fn resources(&self) -> Resources {
        Resources::from_millicores(self.cpu_millicores, self.memory_mb)
    }
}

pub struct ResourceLedger {
    ceiling_cpu_millicores: u64,
    ceiling_memory_mb: u64,
    reservations: Mutex<HashMap<ReservationId, Reservation>>,
}

impl ResourceLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            ceiling_cpu_millicores: config.ceiling.cpu_millicores(),
            ceiling_memory_mb: config.ceiling.memory_mb,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn ceiling(&self) -> Resources {
        Resources::from_millicores(self.ceiling_cpu_millicores, self.ceiling_memory_mb)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ReservationId, Reservation>> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn totals(table: &HashMap<ReservationId, Reservation>) -> (u64, u64) {
        table.values().fold((0, 0), |(cpu, mem), r| {
            (cpu + r.cpu_millicores, mem + r.memory_mb)
        })
    }

    /// Reserves `resources` provisionally, or denies the whole request.
    pub fn reserve(
        &self,
        application_id: ApplicationId,
        resources: &Resources,
    ) -> Result<ReservationId, LedgerError> {
        let cpu = resources.cpu_millicores();
        let memory = resources.memory_mb;

        let mut table = self.table();
        let (committed_cpu, committed_memory) = Self::totals(&table);

        let cpu_fits = committed_cpu.saturating_add(cpu) <= self.ceiling_cpu_millicores;
        let memory_fits = committed_memory.saturating_add(memory) <= self.ceiling_memory_mb;
        if !(cpu_fits && memory_fits) {
            debug!(
                application_id = %application_id,
                requested_cpu_millicores = cpu,
                requested_memory_mb = memory,
                committed_cpu_millicores = committed_cpu,
                committed_memory_mb = committed_memory,
                "Reservation denied"
            );
            return Err(LedgerError::AdmissionDenied {
                requested_cpu: resources.cpu,
                requested_memory_mb: memory,
                committed_cpu: committed_cpu as f64 / 1000.0,
                committed_memory_mb: committed_memory,
                ceiling_cpu: self.ceiling_cpu_millicores as f64 / 1000.0,
                ceiling_memory_mb: self.ceiling_memory_mb,
            });
        }

        let id = ReservationId::new();
        table.insert(
            id,
            Reservation {
                id,
                application_id,
                cpu_millicores: cpu,
                memory_mb: memory,
                state: ReservationState::Provisional,
                created_at: Utc::now(),
            },
        );

        info!(
            reservation_id = %id,
            application_id = %application_id,
            cpu_millicores = cpu,
            memory_mb = memory,
            "Reserved resources"
        );
        Ok(id)
    }

    /// Marks a reservation as backing a live container.
    pub fn promote(&self, id: ReservationId) -> Result<(), LedgerError> {
        let mut table = self.table();
        let reservation = table
            .get_mut(&id)
            .ok_or(LedgerError::UnknownReservation(id))?;
        reservation.state = ReservationState::Confirmed;
        debug!(reservation_id = %id, "Reservation confirmed");
        Ok(())
    }

    /// Removes a reservation, returning its capacity to the pool.
    pub fn release(&self, id: ReservationId) -> Result<Reservation, LedgerError> {
        let removed = self
            .table()
            .remove(&id)
            .ok_or(LedgerError::UnknownReservation(id))?;
        info!(
            reservation_id = %id,
            application_id = %removed.application_id,
            cpu_millicores = removed.cpu_millicores,
            memory_mb = removed.memory_mb,
            "Released reservation"
        );
        Ok(removed)
    }

    /// Records a confirmed reservation for a container that is already
    /// running, e.g. when rebuilding the ledger after a restart.
    ///
    /// The ceiling is not enforced: the capacity is already in use.
    pub fn adopt(&self, application_id: ApplicationId, resources: &Resources) -> ReservationId {
        let id = ReservationId::new();
        let mut table = self.table();
        table.insert(
            id,
            Reservation {
                id,
                application_id,
                cpu_millicores: resources.cpu_millicores(),
                memory_mb: resources.memory_mb,
                state: ReservationState::Confirmed,
                created_at: Utc::now(),
            },
        );

        let (cpu, memory) = Self::totals(&table);
        if cpu > self.ceiling_cpu_millicores || memory > self.ceiling_memory_mb {
            warn!(
                application_id = %application_id,
                committed_cpu_millicores = cpu,
                committed_memory_mb = memory,
                "Adopted reservation leaves the ledger over its ceiling"
            );
        }
        id
    }

    pub fn get(&self, id: ReservationId) -> Option<Reservation> {
        self.table().get(&id).cloned()
    }

    pub fn reservations_for(&self, application_id: ApplicationId) -> Vec<Reservation> {
        let mut found: Vec<_> = self
            .table()
            .values()
            .filter(|r| r.application_id == application_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        found
    }

    pub fn usage(&self) -> LedgerUsage {
        let table = self.table();
        let (cpu_millicores, memory_mb) = Self::totals(&table);
        let confirmed = table
            .values()
            .filter(|r| r.state == ReservationState::Confirmed)
            .count();
        LedgerUsage {
            cpu_millicores,
            memory_mb,
            provisional: table.len() - confirmed,
            confirmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use proptest::prelude::*;

    fn ledger(cpu: f64, memory_mb: u64) -> ResourceLedger {
        ResourceLedger::new(LedgerConfig {
            ceiling: Resources::new(cpu, memory_mb),
        })
    }

    #[test]
    fn test_reserve_within_ceiling() {
        let ledger = ledger(2.0, 1024);
        let id = ledger
            .reserve(ApplicationId::new(), &Resources::new(1.5, 512))
            .unwrap();
        let reservation = ledger.get(id).unwrap();
        assert_eq!(reservation.state, ReservationState::Provisional);
        assert_eq!(ledger.usage().cpu_millicores, 1500);
    }

    #[test]
    fn test_cpu_overflow_denies_whole_request() {
        let ledger = ledger(2.0, 4096);
        ledger
            .reserve(ApplicationId::new(), &Resources::new(1.5, 512))
            .unwrap();

        let err = ledger
            .reserve(ApplicationId::new(), &Resources::new(1.0, 512))
            .unwrap_err();
        assert!(matches!(err, LedgerError::AdmissionDenied { .. }));

        // Nothing partial was recorded.
        let usage = ledger.usage();
        assert_eq!(usage.cpu_millicores, 1500);
        assert_eq!(usage.memory_mb, 512);
        assert_eq!(usage.provisional, 1);
    }

    #[test]
    fn test_memory_overflow_denies() {
        let ledger = ledger(8.0, 1000);
        ledger
            .reserve(ApplicationId::new(), &Resources::new(0.5, 600))
            .unwrap();
        assert!(ledger
            .reserve(ApplicationId::new(), &Resources::new(0.5, 401))
            .is_err());
        assert!(ledger
            .reserve(ApplicationId::new(), &Resources::new(0.5, 400))
            .is_ok());
    }

    #[test]
    fn test_exact_fit_is_admitted() {
        let ledger = ledger(2.0, 1024);
        ledger
            .reserve(ApplicationId::new(), &Resources::new(1.0, 512))
            .unwrap();
        ledger
            .reserve(ApplicationId::new(), &Resources::new(1.0, 512))
            .unwrap();
        assert_eq!(ledger.usage().resources(), Resources::new(2.0, 1024));
    }

    #[test]
    fn test_promote_and_release() {
        let ledger = ledger(2.0, 1024);
        let app = ApplicationId::new();
        let id = ledger.reserve(app, &Resources::new(1.0, 256)).unwrap();

        ledger.promote(id).unwrap();
        assert_eq!(ledger.get(id).unwrap().state, ReservationState::Confirmed);
        assert_eq!(ledger.usage().confirmed, 1);

        let released = ledger.release(id).unwrap();
        assert_eq!(released.application_id, app);
        assert_eq!(ledger.usage(), LedgerUsage::default());
        assert!(matches!(
            ledger.release(id),
            Err(LedgerError::UnknownReservation(_))
        ));
        assert!(ledger.promote(id).is_err());
    }

    #[test]
    fn test_adopt_ignores_ceiling() {
        let ledger = ledger(1.0, 256);
        let app = ApplicationId::new();
        let id = ledger.adopt(app, &Resources::new(2.0, 512));
        assert_eq!(ledger.get(id).unwrap().state, ReservationState::Confirmed);
        assert_eq!(ledger.reservations_for(app).len(), 1);
        assert!(ledger
            .reserve(ApplicationId::new(), &Resources::new(0.1, 1))
            .is_err());
    }

    #[test]
    fn test_concurrent_reserves_never_exceed_ceiling() {
        let ledger = Arc::new(ledger(4.0, 1 << 20));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger
                        .reserve(ApplicationId::new(), &Resources::new(0.75, 1))
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        // 5 * 750 = 3750 fits, a sixth would be 4500.
        assert_eq!(admitted, 5);
        assert!(ledger.usage().cpu_millicores <= 4000);
    }

    proptest! {
        #[test]
        fn prop_committed_never_exceeds_ceiling(
            ops in prop::collection::vec((0u64..3000, 0u64..2048, any::<bool>()), 1..64)
        ) {
            let ledger = ledger(4.0, 4096);
            let mut held = Vec::new();
            for (cpu, memory, release_one) in ops {
                if let Ok(id) = ledger.reserve(
                    ApplicationId::new(),
                    &Resources::new(cpu as f64 / 1000.0, memory),
                ) {
                    held.push(id);
                }
                if release_one {
                    if let Some(id) = held.pop() {
                        ledger.release(id).unwrap();
                    }
                }
                let usage = ledger.usage();
                prop_assert!(usage.cpu_millicores <= 4000);
                prop_assert!(usage.memory_mb <= 4096);
            }
        }
    }
}
