//! Subnet-wide identity polling.

use futures::future::join_all;
use log::{debug, info, trace};
use std::collections::BTreeMap;

use super::SubnetPrefix;
use crate::device::DeviceTransport;
use crate::metrics;

/// One device that answered a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub network_address: String,
    pub status: String,
}

/// Normalized hardware address → where it answered.
pub type ScanMap = BTreeMap<String, ScanHit>;

/// Probe all 254 hosts of `prefix` at once.
pub async fn scan_subnet(transport: &dyn DeviceTransport, prefix: &SubnetPrefix) -> ScanMap {
    debug!("Scanning {}.0/24", prefix);
    scan_addresses(transport, prefix.hosts()).await
}

/// Probe an explicit list of network addresses concurrently. When two addresses
/// report the same hardware address, the one listed first is kept.
pub async fn scan_addresses<I>(transport: &dyn DeviceTransport, addresses: I) -> ScanMap
where
    I: IntoIterator<Item = String>,
{
    let addresses: Vec<String> = addresses.into_iter().collect();
    let probes = addresses.iter().map(|addr| {
        metrics::inc_probes_sent();
        transport.probe(addr)
    });
    let results = join_all(probes).await;

    let mut map = ScanMap::new();
    let mut anonymous = 0usize;
    for (addr, result) in addresses.into_iter().zip(results) {
        let report = match result {
            Ok(r) if r.is_acceptable() => r,
            Ok(_) => {
                trace!("{}: answered without identity", addr);
                continue;
            }
            Err(e) => {
                trace!("{}: {}", addr, e);
                continue;
            }
        };
        metrics::inc_probes_accepted();
        let Some(hw) = report.normalized_address() else {
            anonymous += 1;
            debug!("{}: ready but reported no hardware address", addr);
            continue;
        };
        match map.get(&hw) {
            Some(first) => {
                metrics::inc_duplicate_identities();
                info!(
                    "Hardware address {} answered at both {} and {}; keeping {}",
                    hw, first.network_address, addr, first.network_address
                );
            }
            None => {
                map.insert(
                    hw,
                    ScanHit {
                        network_address: addr,
                        status: report.status().to_string(),
                    },
                );
            }
        }
    }
    debug!(
        "Scan found {} device(s), {} without identity",
        map.len(),
        anonymous
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockTransport;
    use crate::device::{IdentityReport, TransportError};

    #[tokio::test]
    async fn collects_identified_devices() {
        let mock = MockTransport::new();
        mock.add_device("10.0.0.5", "AA:BB:CC:DD:EE:FF");
        mock.add_device("10.0.0.9", "11-22-33-44-55-66");
        mock.set_probe("10.0.0.7", Err(TransportError::Timeout));

        let map = scan_subnet(&mock, &SubnetPrefix::new(10, 0, 0)).await;
        assert_eq!(map.len(), 2);
        assert_eq!(map["AABBCCDDEEFF"].network_address, "10.0.0.5");
        assert_eq!(map["112233445566"].status, "ready");
        assert_eq!(mock.probe_log().len(), 254);
    }

    #[tokio::test]
    async fn duplicate_identity_keeps_first() {
        let mock = MockTransport::new();
        mock.add_device("10.0.0.3", "AA:BB:CC:DD:EE:FF");
        mock.add_device("10.0.0.4", "aabbccddeeff");
        let map = scan_addresses(&mock, ["10.0.0.3".to_string(), "10.0.0.4".to_string()]).await;
        assert_eq!(map.len(), 1);
        assert_eq!(map["AABBCCDDEEFF"].network_address, "10.0.0.3");
    }

    #[tokio::test]
    async fn discards_unacceptable_answers() {
        let mock = MockTransport::new();
        mock.set_probe(
            "10.0.0.1",
            Ok(IdentityReport {
                hardware_address: None,
                status: Some("error".into()),
            }),
        );
        mock.set_probe(
            "10.0.0.2",
            Ok(IdentityReport {
                hardware_address: None,
                status: Some("ready".into()),
            }),
        );
        mock.set_probe("10.0.0.3", Err(TransportError::Malformed("html".into())));
        let map = scan_addresses(
            &mock,
            ["10.0.0.1", "10.0.0.2", "10.0.0.3"].map(String::from),
        )
        .await;
        assert!(map.is_empty());
    }
}
