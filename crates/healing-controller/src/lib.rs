/*
 * 5D Labs Agent Platform - Self-Healing Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Self-healing controller library
//!
//! Watches `HealingPolicy` resources, evaluates their triggers against live
//! metrics, and drives the resulting `HealingAction`s through a safety gate
//! and a retrying remediation engine.

pub mod crds;
pub mod healing;

// Re-export commonly used types
pub use crds::{
    HealingAction, HealingActionSpec, HealingActionStatus, HealingPolicy, HealingPolicySpec,
    HealingPolicyStatus,
};
pub use healing::config::ControllerConfig;
pub use healing::{build_context, recover_state, run_healing_controller};
