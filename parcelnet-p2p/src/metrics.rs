//! Network metrics.
//!
//! A [`MetricsRegistry`] is created by the application and handed to one
//! network, which keeps it current. [`MetricsRegistry::encode`] renders it
//! in the Prometheus text exposition format.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::error::{P2pError, P2pResult};

/// A monotonically increasing counter.
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up or down.
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge raised for the lifetime of the guard.
pub struct GaugeGuard<'a>(&'a Gauge);

impl<'a> GaugeGuard<'a> {
    pub fn new(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Metrics of one network.
pub struct MetricsRegistry {
    claimed: AtomicBool,

    pub connections: Gauge,
    pub incoming: Gauge,
    pub outgoing: Gauge,
    pub connecting: Gauge,
    pub known_peers: Gauge,

    pub parcels_sent: Counter,
    pub parcels_received: Counter,
    pub app_sent: Counter,
    pub app_received: Counter,
    pub cat_rounds: Counter,

    pub bytes_down_rate: Gauge,
    pub bytes_up_rate: Gauge,
    pub dropped: Gauge,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            connections: Gauge::new("parcelnet_p2p_connections", "Number of connected peers"),
            incoming: Gauge::new("parcelnet_p2p_connections_incoming", "Number of incoming connections"),
            outgoing: Gauge::new("parcelnet_p2p_connections_outgoing", "Number of outgoing connections"),
            connecting: Gauge::new("parcelnet_p2p_connecting", "Connections in the handshake phase"),
            known_peers: Gauge::new("parcelnet_p2p_known_peers", "Peers known after the last peer share"),
            parcels_sent: Counter::new("parcelnet_p2p_parcels_sent_total", "Parcels queued to peers"),
            parcels_received: Counter::new("parcelnet_p2p_parcels_received_total", "Parcels received from peers"),
            app_sent: Counter::new("parcelnet_p2p_app_sent_total", "Application parcels routed to the network"),
            app_received: Counter::new("parcelnet_p2p_app_received_total", "Application parcels delivered to the application"),
            cat_rounds: Counter::new("parcelnet_p2p_cat_rounds_total", "Completed connect and trim rounds"),
            bytes_down_rate: Gauge::new("parcelnet_p2p_bytes_down_per_second", "Bytes per second received from all peers"),
            bytes_up_rate: Gauge::new("parcelnet_p2p_bytes_up_per_second", "Bytes per second sent to all peers"),
            dropped: Gauge::new("parcelnet_p2p_dropped_parcels", "Parcels dropped by full peer send queues"),
        }
    }

    /// Bind the registry to a network. Fails if it is already bound.
    pub fn claim(&self) -> P2pResult<()> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Err(P2pError::RegistryClaimed);
        }
        Ok(())
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(2048);

        for gauge in [
            &self.connections,
            &self.incoming,
            &self.outgoing,
            &self.connecting,
            &self.known_peers,
        ] {
            write_gauge(&mut out, gauge);
        }

        for counter in [
            &self.parcels_sent,
            &self.parcels_received,
            &self.app_sent,
            &self.app_received,
            &self.cat_rounds,
        ] {
            write_counter(&mut out, counter);
        }

        for gauge in [&self.bytes_down_rate, &self.bytes_up_rate, &self.dropped] {
            write_gauge(&mut out, gauge);
        }

        out
    }
}

fn write_counter(out: &mut String, counter: &Counter) {
    let (name, help) = (counter.name, counter.help);
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {}\n\n", counter.get()));
}

fn write_gauge(out: &mut String, gauge: &Gauge) {
    let (name, help) = (gauge.name, gauge.help);
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {}\n\n", gauge.get()));
}
