// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-flight issuance guard.
//!
//! Issuing a slip is a monetary side effect, so a second `close_invoice`
//! for the same key must not start while the first is still awaiting the
//! provider (the classic double-click). The guard is a reservation held for
//! the duration of the issuance call; it complements, not replaces, the
//! read-before-write idempotency check against the record store.

use crate::base::ClosureKey;
use crate::error::ClosureError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Tracks closure keys with an issuance call in flight.
///
/// Reservations use the map's entry API for an atomic check-and-insert, so
/// two concurrent reservations for one key cannot both succeed.
#[derive(Debug, Default)]
pub struct IssuanceLog {
    inflight: DashMap<ClosureKey, ()>,
}

impl IssuanceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the key for one issuance attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ClosureError::IssuanceInFlight`] if another attempt holds
    /// the reservation.
    pub fn begin(&self, key: &ClosureKey) -> Result<IssuanceGuard<'_>, ClosureError> {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(_) => Err(ClosureError::IssuanceInFlight),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(IssuanceGuard {
                    log: self,
                    key: key.clone(),
                })
            }
        }
    }

    pub fn is_inflight(&self, key: &ClosureKey) -> bool {
        self.inflight.contains_key(key)
    }
}

/// Releases the reservation when dropped, on success and failure alike.
#[derive(Debug)]
pub struct IssuanceGuard<'a> {
    log: &'a IssuanceLog,
    key: ClosureKey,
}

impl Drop for IssuanceGuard<'_> {
    fn drop(&mut self) {
        self.log.inflight.remove(&self.key);
    }
}
