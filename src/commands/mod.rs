// SPDX-License-Identifier: Apache-2.0

// Command surface: query bridge, background processes, metrics

pub mod bgprocess;
pub mod metrics;
pub mod query;
