// Copyright (C) 2025 the flus authors
//
// This file is part of flus.
//
// flus is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// flus is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with flus.  If not, see
// <http://www.gnu.org/licenses/>.

//! # flus metrics
//!
//! flus collects metrics through [OpenTelemetry]. Instruments are meant to be created once &
//! re-used, which raises the question of where to keep them. Rather than threading a registry of
//! instruments through the application state, each instrument is declared right next to the code
//! that updates it:
//!
//! ```ignore
//! define_metric! { "feeds.fetched", feeds_fetched, Sort::IntegralCounter }
//! // ...
//! feeds_fetched.add(1, &[]);
//! ```
//!
//! [define_metric!] expands to a lazily-initialized static instrument built on the global meter,
//! plus an [inventory] registration of the metric's name. Since metric names are free-form strings
//! scattered across the crate, nothing stops two modules from claiming the same one;
//! [check_metric_names] walks the registrations & reports any such clash. `flusd` calls it at
//! startup.
//!
//! The instruments are initialized on first use. Since `flusd` installs its meter provider before
//! doing anything else, they bind to that provider; in the CLI & in tests, they bind to the no-op
//! provider.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//! [inventory]: https://docs.rs/inventory

use std::collections::HashSet;

use snafu::{Backtrace, prelude::*};

/// The name of the meter on which all flus instruments are created
pub const METER_NAME: &str = "flus";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The metric name {name} was registered more than once"))]
    DuplicateMetric {
        name: &'static str,
        backtrace: Backtrace,
    },
}

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<f64>`
    FloatGauge,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The type of thing being inventoried
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Fail if any metric name has been registered twice
pub fn check_metric_names() -> Result<(), Error> {
    let mut names = HashSet::new();
    inventory::iter::<Registration>
        .into_iter()
        .try_for_each(|reg| {
            if names.insert(reg.name()) {
                Ok(())
            } else {
                DuplicateMetricSnafu { name: reg.name() }.fail()
            }
        })
}

/// All registered metrics, sorted by name
pub fn registrations() -> Vec<&'static Registration> {
    let mut regs: Vec<&'static Registration> = inventory::iter::<Registration>.into_iter().collect();
    regs.sort_by_key(|reg| reg.name());
    regs
}

/// Declare & register an OpenTelemetry instrument
///
/// ```ignore
/// define_metric! { "client.requests", client_requests, Sort::IntegralCounter }
/// ```
///
/// defines a static `client_requests: Counter<u64>` on the "flus" meter, named "client.requests".
#[macro_export]
macro_rules! define_metric {
    ($name:literal, $ident:ident, Sort::IntegralCounter) => {
        ::inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralCounter)
        }
        ::lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: ::opentelemetry::metrics::Counter<u64> =
                ::opentelemetry::global::meter($crate::metrics::METER_NAME)
                    .u64_counter($name)
                    .build();
        }
    };
    ($name:literal, $ident:ident, Sort::FloatGauge) => {
        ::inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::FloatGauge)
        }
        ::lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: ::opentelemetry::metrics::Gauge<f64> =
                ::opentelemetry::global::meter($crate::metrics::METER_NAME)
                    .f64_gauge($name)
                    .build();
        }
    };
    ($name:literal, $ident:ident, Sort::IntegralGauge) => {
        ::inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralGauge)
        }
        ::lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: ::opentelemetry::metrics::Gauge<u64> =
                ::opentelemetry::global::meter($crate::metrics::METER_NAME)
                    .u64_gauge($name)
                    .build();
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metric_names_are_unique() {
        check_metric_names().unwrap();
        let regs = registrations();
        assert!(regs.iter().any(|reg| reg.name() == "client.requests"));
        assert!(
            regs.iter()
                .any(|reg| reg.name() == "jobs.in_flight" && reg.sort() == Sort::IntegralGauge)
        );
    }
}
