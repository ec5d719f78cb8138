//! In-memory transport for unit tests.
//!
//! Devices are registered per network address; unknown addresses behave like an
//! empty subnet slot (connection refused). Every call is recorded so tests can
//! assert which devices were probed or sent commands.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{DeviceTransport, IdentityReport, TransportError};

#[derive(Debug, Default)]
struct Inner {
    probes: HashMap<String, Vec<Result<IdentityReport, TransportError>>>,
    dispense: HashMap<String, Result<(), TransportError>>,
    probe_log: Vec<String>,
    dispense_log: Vec<(String, u32)>,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address answers every probe with a ready device.
    pub fn add_device(&self, network_address: &str, hardware_address: &str) {
        self.set_probe(
            network_address,
            Ok(IdentityReport::new(hardware_address)),
        );
    }

    /// Replace the probe behaviour for an address with a single repeating answer.
    pub fn set_probe(&self, network_address: &str, answer: Result<IdentityReport, TransportError>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .probes
            .insert(network_address.to_string(), vec![answer]);
    }

    /// Queue answers consumed in order; the last one repeats.
    pub fn set_probe_sequence(
        &self,
        network_address: &str,
        answers: Vec<Result<IdentityReport, TransportError>>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.probes.insert(network_address.to_string(), answers);
    }

    pub fn remove_device(&self, network_address: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.probes.remove(network_address);
    }

    pub fn set_dispense(&self, network_address: &str, answer: Result<(), TransportError>) {
        let mut inner = self.inner.lock().unwrap();
        inner.dispense.insert(network_address.to_string(), answer);
    }

    pub fn probe_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().probe_log.clone()
    }

    pub fn probes_to(&self, network_address: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .probe_log
            .iter()
            .filter(|a| a.as_str() == network_address)
            .count()
    }

    pub fn dispense_log(&self) -> Vec<(String, u32)> {
        self.inner.lock().unwrap().dispense_log.clone()
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn probe(&self, network_address: &str) -> Result<IdentityReport, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_log.push(network_address.to_string());
        match inner.probes.get_mut(network_address) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue
                .first()
                .cloned()
                .unwrap_or(Err(TransportError::Refused)),
            None => Err(TransportError::Refused),
        }
    }

    async fn dispense(
        &self,
        network_address: &str,
        total_quantity: u32,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .dispense_log
            .push((network_address.to_string(), total_quantity));
        inner
            .dispense
            .get(network_address)
            .cloned()
            .unwrap_or(Ok(()))
    }
}
