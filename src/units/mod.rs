/*
 * Amapiano Host - Real-time Plugin Host
 * Copyright (c) 2025 MACHIKO LAB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Bundled processing units

pub mod biquad;
pub mod equalizer;
pub mod log_drum;

pub use equalizer::EqualizerUnit;
pub use log_drum::LogDrumUnit;

use crate::errors::{UnitError, UnitResult};

/// Lifecycle of a unit instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Ready,
    Disposed,
}

impl UnitState {
    #[inline]
    pub fn check_ready(&self) -> UnitResult<()> {
        match self {
            UnitState::Ready => Ok(()),
            UnitState::Created => Err(UnitError::NotInitialized),
            UnitState::Disposed => Err(UnitError::Disposed),
        }
    }
}
